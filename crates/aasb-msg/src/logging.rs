//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Envelope activity logging."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::envelope::Envelope;

/// Direction of envelope movement, used for consistent logging and journaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Handed to the transport by this broker.
    Outbound,
    /// Received from the transport.
    Inbound,
}

impl MessageDirection {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::Outbound => "outbound",
            MessageDirection::Inbound => "inbound",
        }
    }
}

/// Emit a structured log entry for envelope activity.
///
/// The payload is only attached at `TRACE`.
pub fn log_envelope(direction: MessageDirection, envelope: &Envelope) {
    debug!(
        direction = direction.as_str(),
        message_id = %envelope.message_id,
        reply_to_id = envelope.reply_to_id.as_deref().unwrap_or(""),
        topic = %envelope.topic,
        action = %envelope.action,
        payload_len = envelope.payload.len(),
        "envelope activity"
    );
    trace!(
        direction = direction.as_str(),
        message_id = %envelope.message_id,
        payload = %envelope.payload,
        "envelope payload"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::level_filters::LevelFilter;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    type Records = Arc<Mutex<Vec<(Level, Vec<String>)>>>;

    struct FieldNames(Vec<String>);

    impl Visit for FieldNames {
        fn record_debug(&mut self, field: &Field, _value: &dyn std::fmt::Debug) {
            self.0.push(field.name().to_owned());
        }
    }

    struct Capture(Records);

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut names = FieldNames(Vec::new());
            event.record(&mut names);
            self.0.lock().push((*event.metadata().level(), names.0));
        }
    }

    fn capture(max_level: LevelFilter, envelope: &Envelope) -> Vec<(Level, Vec<String>)> {
        let records = Records::default();
        let subscriber = tracing_subscriber::registry()
            .with(max_level)
            .with(Capture(records.clone()));
        tracing::subscriber::with_default(subscriber, || {
            log_envelope(MessageDirection::Outbound, envelope);
        });
        let captured = records.lock().clone();
        captured
    }

    fn has_field(fields: &[String], name: &str) -> bool {
        fields.iter().any(|field| field == name)
    }

    #[test]
    fn payload_is_logged_only_at_trace() {
        let envelope = Envelope::new("AlexaClient", "GetState", r#"{"secret":"token"}"#);

        let debug = capture(LevelFilter::DEBUG, &envelope);
        assert_eq!(debug.len(), 1);
        let (level, fields) = &debug[0];
        assert_eq!(*level, Level::DEBUG);
        for name in ["direction", "message_id", "topic", "action", "payload_len"] {
            assert!(has_field(fields, name), "missing {name}");
        }
        assert!(!has_field(fields, "payload"));

        let trace = capture(LevelFilter::TRACE, &envelope);
        let payload_levels: Vec<Level> = trace
            .iter()
            .filter(|(_, fields)| has_field(fields, "payload"))
            .map(|(level, _)| *level)
            .collect();
        assert_eq!(payload_levels, vec![Level::TRACE]);
    }

    #[test]
    fn direction_labels() {
        assert_eq!(MessageDirection::Inbound.as_str(), "inbound");
        assert_eq!(MessageDirection::Outbound.as_str(), "outbound");
    }
}
