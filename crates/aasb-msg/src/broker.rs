//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Broker facade: publish, request/reply, subscriptions, streams."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Process-scoped broker handle.
//!
//! A [`MessageBroker`] is the composition root for one transport link: it
//! owns the dispatcher, the stream registry and the expiry ticker, and is
//! passed explicitly to the components that publish or subscribe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aasb_logging::{log_lifecycle_event, LifecycleOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::watch;

use crate::correlation::{AbortReason, Waiter};
use crate::dispatcher::Dispatcher;
use crate::envelope::Envelope;
use crate::journal::MessageJournal;
use crate::metrics::{MessagingMetrics, MessagingMetricsExporter};
use crate::observable::ConnectionState;
use crate::stream::{Stream, StreamMode, StreamRegistry};
use crate::subscription::{handler_fn, MessageHandler, SubscriptionHandle};
use crate::transport::Transport;
use crate::{MessagingError, Result};

fn default_reply_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_expiry_interval() -> Duration {
    Duration::from_millis(100)
}

/// Broker section of the configuration file.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Timeout applied when a request does not name one.
    #[serde(rename = "default_reply_timeout_ms", default = "default_reply_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_reply_timeout: Duration,
    /// Period of the background expiry sweep. Zero disables the sweep;
    /// waiters still honour their own deadlines.
    #[serde(rename = "expiry_interval_ms", default = "default_expiry_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub expiry_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_reply_timeout: default_reply_timeout(),
            expiry_interval: default_expiry_interval(),
        }
    }
}

/// Step-wise construction of a [`MessageBroker`].
pub struct BrokerBuilder {
    transport: Arc<dyn Transport>,
    config: BrokerConfig,
    exporter: Option<MessagingMetricsExporter>,
    journal: Option<MessageJournal>,
}

impl BrokerBuilder {
    /// Override the default configuration.
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Mirror broker activity into Prometheus.
    pub fn metrics(mut self, exporter: MessagingMetricsExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Journal every envelope.
    pub fn journal(mut self, journal: MessageJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Attach to the transport and start the expiry ticker.
    pub fn build(self) -> Result<MessageBroker> {
        let mut dispatcher = Dispatcher::new(self.transport.clone());
        if let Some(exporter) = self.exporter {
            dispatcher = dispatcher.with_metrics(exporter);
        }
        if let Some(journal) = self.journal {
            dispatcher = dispatcher.with_journal(journal);
        }
        let dispatcher = dispatcher.attach()?;
        let ticker = if self.config.expiry_interval.is_zero() {
            None
        } else {
            Some(ExpiryTicker::spawn(
                dispatcher.clone(),
                self.config.expiry_interval,
            )?)
        };
        log_lifecycle_event(
            None,
            "broker.start",
            &format!("broker attached to {}", self.transport.name()),
            LifecycleOutcome::Success,
        );
        Ok(MessageBroker {
            streams: StreamRegistry::new(self.transport),
            dispatcher,
            config: self.config,
            shut_down: AtomicBool::new(false),
            ticker: Mutex::new(ticker),
        })
    }
}

struct ExpiryTicker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ExpiryTicker {
    fn spawn(dispatcher: Arc<Dispatcher>, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("aasb-expiry".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        dispatcher.expire_pending();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

/// Unsubscribes when dropped.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct ScopedSubscription {
    dispatcher: Arc<Dispatcher>,
    handle: SubscriptionHandle,
}

impl ScopedSubscription {
    /// Underlying registration handle.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        self.dispatcher.unregister_handler(self.handle);
    }
}

/// Publish/subscribe, request/reply and stream API over one transport.
pub struct MessageBroker {
    dispatcher: Arc<Dispatcher>,
    streams: Arc<StreamRegistry>,
    config: BrokerConfig,
    shut_down: AtomicBool,
    ticker: Mutex<Option<ExpiryTicker>>,
}

impl MessageBroker {
    /// Broker with default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::builder(transport).build()
    }

    /// Start building a broker over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> BrokerBuilder {
        BrokerBuilder {
            transport,
            config: BrokerConfig::default(),
            exporter: None,
            journal: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Underlying dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register `handler` for the exact (topic, action) pair.
    pub fn subscribe<F>(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher
            .register_handler(topic, action, handler_fn(handler))
    }

    /// Register a shared handler object.
    pub fn subscribe_handler(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        self.dispatcher.register_handler(topic, action, handler)
    }

    /// Register `handler` for as long as the returned guard lives.
    pub fn subscribe_scoped<F>(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        handler: F,
    ) -> ScopedSubscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        ScopedSubscription {
            handle: self.subscribe(topic, action, handler),
            dispatcher: self.dispatcher.clone(),
        }
    }

    /// Remove a registration. Unknown handles are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.dispatcher.unregister_handler(handle)
    }

    /// Publish a new envelope and return its message id.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<String> {
        let envelope = Envelope::new(topic, action, payload);
        self.publish_envelope(&envelope)?;
        Ok(envelope.message_id)
    }

    /// Publish a caller-built envelope as is.
    pub fn publish_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.ensure_running()?;
        self.dispatcher.publish(envelope)
    }

    /// Answer `request` with `payload`, returning the reply's message id.
    pub fn reply(&self, request: &Envelope, payload: impl Into<String>) -> Result<String> {
        let reply = Envelope::reply_to(request, payload);
        self.publish_envelope(&reply)?;
        Ok(reply.message_id)
    }

    /// Publish a request and return the waiter for its reply.
    ///
    /// The waiter is tracked before the request leaves, so a fast reply
    /// cannot be missed. `None` applies the configured default timeout.
    pub fn request(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Waiter> {
        self.ensure_running()?;
        let envelope = Envelope::new(topic, action, payload);
        let timeout = timeout.unwrap_or(self.config.default_reply_timeout);
        let waiter = self
            .dispatcher
            .correlation()
            .track(envelope.message_id.clone(), Some(timeout))?;
        if let Err(err) = self.dispatcher.publish(&envelope) {
            waiter.cancel();
            return Err(err);
        }
        Ok(waiter)
    }

    /// Publish a request and block until its reply, timeout or failure.
    pub fn publish_and_await_reply(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let waiter = self.request(topic, action, payload, timeout)?;
        Ok(waiter.wait()?)
    }

    /// Async flavour of [`MessageBroker::publish_and_await_reply`].
    pub async fn publish_and_await_reply_async(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        payload: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let waiter = self.request(topic, action, payload, timeout)?;
        Ok(waiter.wait_async().await?)
    }

    /// Open a binary stream.
    pub fn open_stream(&self, stream_id: &str, mode: StreamMode) -> Result<Stream> {
        self.ensure_running()?;
        Ok(self.streams.open_stream(stream_id, mode)?)
    }

    /// Run one expiry sweep now. Returns how many requests timed out.
    pub fn expire_pending(&self) -> usize {
        self.dispatcher.expire_pending()
    }

    /// Requests still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.dispatcher.correlation().pending_count()
    }

    /// Current link state.
    pub fn connection_state(&self) -> ConnectionState {
        self.dispatcher.connection().get()
    }

    /// Receiver replaying the current link state and every later change.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.dispatcher.connection().subscribe()
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> MessagingMetrics {
        self.dispatcher.metrics()
    }

    /// Whether [`MessageBroker::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop the broker: pending requests fail with a shutdown error,
    /// subscriptions are dropped and the transport is disconnected.
    /// Later publishes fail with [`MessagingError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        self.dispatcher.connection().set(ConnectionState::Shutdown);
        let aborted = self
            .dispatcher
            .correlation()
            .abort_all(AbortReason::Shutdown);
        self.dispatcher.clear_handlers();
        self.dispatcher.transport().disconnect();
        log_lifecycle_event(
            None,
            "broker.shutdown",
            &format!("broker stopped, {aborted} pending request(s) failed"),
            LifecycleOutcome::Success,
        );
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(MessagingError::Shutdown);
        }
        Ok(())
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
    }
}
