//! ---
//! aasb_section: "03-logging"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Structured logging adapters for message routing."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Logging helpers shared by the broker crates.
//!
//! Routing events are stamped with the envelope coordinates (topic, action,
//! message id, stream id) so that a single message can be followed through
//! publish, transport, correlation and handler invocation.

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

/// Initialize a baseline tracing subscriber writing to stderr, suitable for
/// tools and tests.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Envelope coordinates propagated by the logging macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Routing topic of the envelope.
    pub topic: Option<&'a str>,
    /// Routing action of the envelope.
    pub action: Option<&'a str>,
    /// Message identifier.
    pub message_id: Option<&'a str>,
    /// Identifier of the binary stream involved, if any.
    pub stream_id: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a (topic, action) route.
    pub fn route(topic: &'a str, action: &'a str) -> Self {
        Self::default().with_topic(topic).with_action(action)
    }

    /// Attach a topic.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach an action.
    pub fn with_action(mut self, action: &'a str) -> Self {
        self.action = Some(action);
        self
    }

    /// Attach a message identifier.
    pub fn with_message_id(mut self, message_id: &'a str) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Attach a stream identifier.
    pub fn with_stream_id(mut self, stream_id: &'a str) -> Self {
        self.stream_id = Some(stream_id);
        self
    }
}

/// Outcome used when emitting lifecycle log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The operation completed successfully.
    Success,
    /// The operation failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (connect, shutdown, stream close, ...).
pub fn log_lifecycle_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: LifecycleOutcome,
) {
    let default = LogContext::default();
    let ctx = context.unwrap_or(&default);
    // `tracing::event!` needs a constant level, hence the match.
    match outcome {
        LifecycleOutcome::Success => tracing::event!(
            Level::INFO,
            event,
            outcome = outcome.as_str(),
            topic = ctx.topic.unwrap_or(""),
            action = ctx.action.unwrap_or(""),
            message_id = ctx.message_id.unwrap_or(""),
            stream_id = ctx.stream_id.unwrap_or(""),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::event!(
            Level::ERROR,
            event,
            outcome = outcome.as_str(),
            topic = ctx.topic.unwrap_or(""),
            action = ctx.action.unwrap_or(""),
            message_id = ctx.message_id.unwrap_or(""),
            stream_id = ctx.stream_id.unwrap_or(""),
            message = %message
        ),
    }
}
