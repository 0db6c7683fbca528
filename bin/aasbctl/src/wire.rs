//! ---
//! aasb_section: "05-tooling"
//! aasb_subsection: "binary"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Operator CLI for the AASB broker."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use aasb_msg::{decode as decode_envelope, encode as encode_envelope, Envelope};
use anyhow::{Context, Result};
use clap::Args;

/// Payload given inline or read from a file.
#[derive(Debug, Args)]
pub struct PayloadArgs {
    /// Payload text, usually JSON.
    #[arg(long, value_name = "TEXT", default_value = "{}", conflicts_with = "payload_file")]
    payload: String,

    /// Read the payload from a file instead.
    #[arg(long = "payload-file", value_name = "FILE")]
    payload_file: Option<PathBuf>,
}

impl PayloadArgs {
    pub fn load(&self) -> Result<String> {
        match &self.payload_file {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("unable to read payload file {}", path.display())),
            None => Ok(self.payload.clone()),
        }
    }
}

#[derive(Debug, Args)]
pub struct EncodeArgs {
    #[arg(long)]
    topic: String,
    #[arg(long)]
    action: String,
    #[command(flatten)]
    payload: PayloadArgs,
    /// Use this message id instead of a generated one.
    #[arg(long = "message-id", value_name = "ID")]
    message_id: Option<String>,
    /// Mark the envelope as a reply to this message id.
    #[arg(long = "reply-to", value_name = "ID")]
    reply_to: Option<String>,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// File holding one wire message; stdin when omitted or `-`.
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,
}

pub fn encode(args: EncodeArgs) -> Result<()> {
    let mut envelope = Envelope::new(args.topic, args.action, args.payload.load()?);
    if let Some(id) = args.message_id {
        envelope = envelope.with_message_id(id);
    }
    if let Some(reply_to) = args.reply_to {
        envelope = envelope.with_reply_to(reply_to);
    }
    envelope.validate().context("envelope is not valid")?;
    let bytes = encode_envelope(&envelope).context("failed to encode envelope")?;

    let mut stdout = io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.write_all(b"\n")?;
    Ok(())
}

pub fn decode(args: DecodeArgs) -> Result<()> {
    let bytes = match args.input.as_deref() {
        Some(path) if path.as_os_str() != "-" => fs::read(path)
            .with_context(|| format!("unable to read message file {}", path.display()))?,
        _ => {
            let mut buffer = Vec::new();
            io::stdin()
                .read_to_end(&mut buffer)
                .context("unable to read message from stdin")?;
            buffer
        }
    };
    let envelope = decode_envelope(&bytes).context("message rejected")?;
    let summary = serde_json::json!({
        "messageType": envelope.message_type(),
        "messageId": envelope.message_id,
        "replyToId": envelope.reply_to_id,
        "topic": envelope.topic,
        "action": envelope.action,
        "payload": envelope.payload,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
