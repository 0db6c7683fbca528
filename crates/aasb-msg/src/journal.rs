//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "NDJSON message journal and replay."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Append-only journal of envelope traffic.
//!
//! One JSON object per line. The journal is a diagnostic record; replaying it
//! republishes the selected direction through a live broker.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::MessageBroker;
use crate::envelope::Envelope;
use crate::logging::MessageDirection;
use crate::Result;

/// One journaled envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Position in the journal, starting at 1.
    pub sequence: u64,
    /// When the envelope was recorded.
    pub timestamp: DateTime<Utc>,
    /// Whether the envelope was sent or received.
    pub direction: MessageDirection,
    /// Envelope message id.
    pub message_id: String,
    /// Envelope reply marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    /// Routing topic.
    pub topic: String,
    /// Routing action.
    pub action: String,
    /// Opaque payload text.
    pub payload: String,
}

impl JournalEntry {
    /// Capture `envelope`. The sequence is assigned on append.
    pub fn from_envelope(direction: MessageDirection, envelope: &Envelope) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            direction,
            message_id: envelope.message_id.clone(),
            reply_to_id: envelope.reply_to_id.clone(),
            topic: envelope.topic.clone(),
            action: envelope.action.clone(),
            payload: envelope.payload.clone(),
        }
    }

    /// Rebuild the recorded envelope.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            message_id: self.message_id.clone(),
            reply_to_id: self.reply_to_id.clone(),
            topic: self.topic.clone(),
            action: self.action.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// Append-only journal writer.
pub struct MessageJournal {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl MessageJournal {
    /// Open a journal for appending, continuing the sequence of an existing file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let next_sequence = if path.exists() {
            last_sequence(path)?
        } else {
            0
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            next_sequence,
        })
    }

    /// Record `envelope` and return the assigned sequence number.
    pub fn record(&mut self, direction: MessageDirection, envelope: &Envelope) -> Result<u64> {
        self.append(JournalEntry::from_envelope(direction, envelope))
    }

    /// Append an entry, assigning the next sequence number.
    pub fn append(&mut self, mut entry: JournalEntry) -> Result<u64> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(entry.sequence)
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn last_sequence(path: &Path) -> Result<u64> {
    let reader = BufReader::new(File::open(path)?);
    let mut last = 0u64;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<JournalEntry>(&line) {
            last = entry.sequence;
        }
    }
    Ok(last)
}

/// Read every entry of a journal, in file order.
pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Republish the journaled envelopes recorded in `direction`.
///
/// Envelopes keep their recorded ids. `delay` is slept before each publish.
pub fn replay_journal(
    path: &Path,
    broker: &MessageBroker,
    direction: MessageDirection,
    delay: Option<Duration>,
) -> Result<usize> {
    let mut count = 0usize;
    for entry in read_journal(path)? {
        if entry.direction != direction {
            continue;
        }
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        broker.publish_envelope(&entry.to_envelope())?;
        count += 1;
    }
    tracing::info!(path = %path.display(), count, "journal replayed");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sequences_continue_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("journal.ndjson");
        let request = Envelope::new("AlexaClient", "GetState", "{}").with_message_id("m1");
        let reply = Envelope::reply_to(&request, r#"{"state":"IDLE"}"#).with_message_id("r1");

        {
            let mut journal = MessageJournal::open(&path).expect("open");
            assert_eq!(journal.record(MessageDirection::Outbound, &request).expect("record"), 1);
            assert_eq!(journal.record(MessageDirection::Inbound, &reply).expect("record"), 2);
        }
        let mut journal = MessageJournal::open(&path).expect("reopen");
        assert_eq!(journal.record(MessageDirection::Outbound, &request).expect("record"), 3);

        let entries = read_journal(&path).expect("read");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].direction, MessageDirection::Inbound);
        assert_eq!(entries[1].to_envelope(), reply);
    }

    #[test]
    fn entries_use_camel_case_keys() {
        let envelope = Envelope::new("Navigation", "StartNavigation", "{}")
            .with_message_id("m1")
            .with_reply_to("m0");
        let entry = JournalEntry::from_envelope(MessageDirection::Inbound, &envelope);
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["messageId"], "m1");
        assert_eq!(json["replyToId"], "m0");
        assert_eq!(json["direction"], "inbound");
    }

    #[test]
    fn malformed_lines_fail_reading() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("journal.ndjson");
        fs::write(&path, "{not json}\n").expect("write");
        assert!(read_journal(&path).is_err());
    }
}
