//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Inbound/outbound envelope router."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! The router between the transport and the local subscribers.
//!
//! Outbound: validate, encode, send. Inbound: decode, try correlation, route
//! to subscribers. Inbound work runs synchronously on the transport callback
//! thread, so delivery order equals wire order.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use aasb_logging::{aasb_debug, aasb_error, aasb_warn, log_lifecycle_event, LifecycleOutcome, LogContext};
use parking_lot::Mutex;

use crate::correlation::{AbortReason, CorrelationTracker};
use crate::envelope::{decode, Envelope};
use crate::journal::MessageJournal;
use crate::logging::{log_envelope, MessageDirection};
use crate::metrics::{Counters, MessagingMetrics, MessagingMetricsExporter};
use crate::observable::{ConnectionState, Latest};
use crate::subscription::{MessageHandler, SubscriptionHandle, SubscriptionTable};
use crate::transport::{FrameReceiver, Transport};
use crate::{MessagingError, Result};

/// Terminal state of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The bytes did not decode into a valid envelope.
    Dropped,
    /// The envelope completed a pending request.
    Correlated,
    /// The envelope was offered to its subscribers.
    Routed {
        /// Handlers invoked.
        invoked: usize,
        /// Handlers that returned an error or panicked.
        failed: usize,
    },
}

/// Envelope router bound to one transport.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    subscriptions: SubscriptionTable,
    correlation: Arc<CorrelationTracker>,
    counters: Counters,
    exporter: Option<MessagingMetricsExporter>,
    journal: Option<Mutex<MessageJournal>>,
    connection: Latest<ConnectionState>,
}

impl Dispatcher {
    /// Dispatcher sending through `transport`. Call [`Dispatcher::attach`] to
    /// start receiving.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            subscriptions: SubscriptionTable::new(),
            correlation: CorrelationTracker::new(),
            counters: Counters::default(),
            exporter: None,
            journal: None,
            connection: Latest::new(ConnectionState::Connected),
        }
    }

    /// Mirror counters into Prometheus.
    pub fn with_metrics(mut self, exporter: MessagingMetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Journal every inbound and outbound envelope.
    pub fn with_journal(mut self, journal: MessageJournal) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    /// Install the dispatcher as the transport's inbound receiver.
    pub fn attach(self) -> Result<Arc<Self>> {
        let dispatcher = Arc::new(self);
        let observer = Arc::downgrade(&dispatcher);
        dispatcher.correlation.set_timeout_observer(move |message_id| {
            if let Some(dispatcher) = observer.upgrade() {
                dispatcher.count_timeouts(&[message_id]);
            }
        });
        let receiver = Arc::downgrade(&dispatcher) as std::sync::Weak<dyn FrameReceiver>;
        dispatcher.transport.set_receiver(receiver)?;
        Ok(dispatcher)
    }

    /// Transport this dispatcher sends through.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Correlation tracker consulted for inbound replies.
    pub fn correlation(&self) -> &Arc<CorrelationTracker> {
        &self.correlation
    }

    /// Register `handler` for (topic, action).
    pub fn register_handler(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let topic = topic.into();
        let action = action.into();
        aasb_debug!(
            context = LogContext::route(&topic, &action),
            "handler registered"
        );
        self.subscriptions.subscribe(topic, action, handler)
    }

    /// Remove a registration. Unknown handles are ignored.
    pub fn unregister_handler(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.unsubscribe(handle)
    }

    /// Number of live registrations.
    pub fn handler_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Drop every registration.
    pub fn clear_handlers(&self) {
        self.subscriptions.clear();
    }

    /// Encode `envelope` and hand it to the transport.
    ///
    /// Never waits for a reply.
    pub fn publish(&self, envelope: &Envelope) -> Result<()> {
        envelope.validate().map_err(MessagingError::InvalidEnvelope)?;
        let bytes = envelope.encode()?;
        let ctx = LogContext::route(&envelope.topic, &envelope.action)
            .with_message_id(&envelope.message_id);
        if let Err(err) = self.transport.send(&bytes) {
            Counters::bump(&self.counters.send_failures, 1);
            aasb_warn!(
                context = ctx,
                "send via {} failed: {}",
                self.transport.name(),
                err
            );
            return Err(err.into());
        }
        Counters::bump(&self.counters.sent, 1);
        if let Some(exporter) = &self.exporter {
            exporter.observe_sent();
        }
        log_envelope(MessageDirection::Outbound, envelope);
        self.record(MessageDirection::Outbound, envelope);
        Ok(())
    }

    /// Process one inbound frame through decode, correlation and routing.
    pub fn dispatch_inbound(&self, bytes: &[u8]) -> Disposition {
        Counters::bump(&self.counters.received, 1);
        if let Some(exporter) = &self.exporter {
            exporter.observe_received();
        }

        let envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                Counters::bump(&self.counters.dropped, 1);
                if let Some(exporter) = &self.exporter {
                    exporter.observe_dropped();
                }
                tracing::warn!(error = %err, len = bytes.len(), "inbound message dropped");
                return Disposition::Dropped;
            }
        };
        log_envelope(MessageDirection::Inbound, &envelope);
        self.record(MessageDirection::Inbound, &envelope);

        if let Some(reply_to_id) = envelope.reply_to_id.as_deref() {
            match self.correlation.resolve(reply_to_id, envelope.clone()) {
                Some(resolution) => {
                    Counters::bump(&self.counters.correlated, 1);
                    if let Some(exporter) = &self.exporter {
                        exporter.observe_correlated(resolution.latency);
                    }
                    tracing::debug!(
                        reply_to_id,
                        latency_us = resolution.latency.as_micros() as u64,
                        "reply correlated"
                    );
                    return Disposition::Correlated;
                }
                None => {
                    Counters::bump(&self.counters.unmatched_replies, 1);
                    if let Some(exporter) = &self.exporter {
                        exporter.observe_unmatched();
                    }
                    aasb_warn!(
                        context = LogContext::route(&envelope.topic, &envelope.action)
                            .with_message_id(&envelope.message_id),
                        "unmatched reply to {}",
                        reply_to_id
                    );
                }
            }
        }

        self.route(&envelope)
    }

    fn route(&self, envelope: &Envelope) -> Disposition {
        Counters::bump(&self.counters.routed, 1);
        let handlers = self.subscriptions.resolve(&envelope.topic, &envelope.action);
        if handlers.is_empty() {
            tracing::trace!(
                topic = %envelope.topic,
                action = %envelope.action,
                "no subscribers"
            );
            return Disposition::Routed {
                invoked: 0,
                failed: 0,
            };
        }

        let mut failed = 0usize;
        for registered in &handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                registered.handler.handle(envelope)
            }));
            let ctx = LogContext::route(&envelope.topic, &envelope.action)
                .with_message_id(&envelope.message_id);
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    aasb_warn!(
                        context = ctx,
                        "handler {} failed: {:#}",
                        registered.handle.id(),
                        err
                    );
                }
                Err(payload) => {
                    failed += 1;
                    aasb_error!(
                        context = ctx,
                        "handler {} panicked: {}",
                        registered.handle.id(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        if failed > 0 {
            Counters::bump(&self.counters.handler_failures, failed as u64);
            if let Some(exporter) = &self.exporter {
                exporter.observe_handler_failures(failed as u64);
            }
        }
        Disposition::Routed {
            invoked: handlers.len(),
            failed,
        }
    }

    /// Fail overdue requests. Returns how many expired.
    pub fn expire_pending(&self) -> usize {
        let expired = self.correlation.expire();
        let expired: Vec<&str> = expired.iter().map(String::as_str).collect();
        self.count_timeouts(&expired);
        expired.len()
    }

    fn count_timeouts(&self, message_ids: &[&str]) {
        if message_ids.is_empty() {
            return;
        }
        Counters::bump(&self.counters.timed_out, message_ids.len() as u64);
        if let Some(exporter) = &self.exporter {
            exporter.observe_timed_out(message_ids.len() as u64);
        }
        for message_id in message_ids {
            aasb_debug!(
                context = LogContext::new().with_message_id(message_id),
                "request timed out"
            );
        }
    }

    /// Snapshot of the dispatcher counters.
    pub fn metrics(&self) -> MessagingMetrics {
        self.counters.snapshot()
    }

    /// Cell tracking the transport link state.
    pub fn connection(&self) -> &Latest<ConnectionState> {
        &self.connection
    }

    fn record(&self, direction: MessageDirection, envelope: &Envelope) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.lock().record(direction, envelope) {
                tracing::warn!(error = %err, "journal write failed");
            }
        }
    }
}

impl FrameReceiver for Dispatcher {
    fn on_receive(&self, bytes: &[u8]) {
        self.dispatch_inbound(bytes);
    }

    fn on_disconnect(&self) {
        if self.connection.get() == ConnectionState::Shutdown {
            return;
        }
        self.connection.set(ConnectionState::Disconnected);
        let aborted = self.correlation.abort_all(AbortReason::Disconnected);
        log_lifecycle_event(
            None,
            "transport.disconnect",
            &format!(
                "{} disconnected, {aborted} pending request(s) failed",
                self.transport.name()
            ),
            LifecycleOutcome::Fault,
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
