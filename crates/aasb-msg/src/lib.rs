//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Message broker core: routing, correlation, streams."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Topic/action message broker.
//!
//! Envelopes are routed by exact (topic, action) match to locally registered
//! handlers; replies are correlated to pending requests by `replyToId`; binary
//! data travels through streams beside the envelope channel.

pub mod broker;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
#[cfg(unix)]
pub mod ipc;
pub mod journal;
pub mod logging;
pub mod metrics;
pub mod observable;
pub mod stream;
pub mod subscription;
pub mod transport;

/// Shared result type for broker operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors surfaced to broker callers.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// An outbound envelope violates the envelope invariants.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[source] DecodeError),
    /// The transport refused the message or is disconnected.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A request completed without a reply.
    #[error(transparent)]
    Reply(#[from] ReplyError),
    /// A request could not be tracked.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    /// A stream operation failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The broker has been shut down.
    #[error("broker has been shut down")]
    Shutdown,
    /// Wrapper for IO errors (journal files, thread spawning).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use broker::{BrokerBuilder, BrokerConfig, MessageBroker, ScopedSubscription};
pub use correlation::{AbortReason, CorrelationError, CorrelationTracker, ReplyError, Waiter};
pub use dispatcher::{Disposition, Dispatcher};
pub use envelope::{decode, encode, new_message_id, DecodeError, Envelope, MessageType};
#[cfg(unix)]
pub use ipc::{IpcListener, IpcTransport};
pub use journal::{read_journal, replay_journal, JournalEntry, MessageJournal};
pub use logging::{log_envelope, MessageDirection};
pub use metrics::{MessagingMetrics, MessagingMetricsExporter};
pub use observable::{ConnectionState, Latest};
pub use stream::{ByteChannel, Stream, StreamError, StreamMode, StreamRegistry};
pub use subscription::{handler_fn, MessageHandler, SubscriptionHandle, SubscriptionTable};
pub use transport::{
    FrameReceiver, InMemoryTransport, LoopbackTransport, Transport, TransportConfig,
    TransportError, TransportKind,
};
