//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Broker counters and Prometheus export."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};

/// Snapshot of broker activity used by dashboards and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MessagingMetrics {
    /// Envelopes handed to the transport.
    pub sent: u64,
    /// Frames received from the transport.
    pub received: u64,
    /// Inbound frames that failed to decode.
    pub dropped: u64,
    /// Replies that completed a pending request.
    pub correlated: u64,
    /// Replies with no pending request.
    pub unmatched_replies: u64,
    /// Envelopes routed to subscribers (including those with none).
    pub routed: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Pending requests that timed out, whether swept or seen by their waiter.
    pub timed_out: u64,
    /// Publishes the transport refused.
    pub send_failures: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) sent: AtomicU64,
    pub(crate) received: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) correlated: AtomicU64,
    pub(crate) unmatched_replies: AtomicU64,
    pub(crate) routed: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) send_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MessagingMetrics {
        MessagingMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            correlated: self.correlated.load(Ordering::Relaxed),
            unmatched_replies: self.unmatched_replies.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// Prometheus metric handles for broker activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    correlated: IntCounter,
    unmatched: IntCounter,
    handler_failures: IntCounter,
    timed_out: IntCounter,
    reply_latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register broker metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let sent = counter("aasb_messages_sent_total", "Envelopes handed to the transport")?;
        let received = counter(
            "aasb_messages_received_total",
            "Frames received from the transport",
        )?;
        let dropped = counter(
            "aasb_messages_dropped_total",
            "Inbound frames discarded because they failed to decode",
        )?;
        let correlated = counter(
            "aasb_replies_correlated_total",
            "Replies matched to a pending request",
        )?;
        let unmatched = counter(
            "aasb_replies_unmatched_total",
            "Replies with no pending request",
        )?;
        let handler_failures = counter(
            "aasb_handler_failures_total",
            "Subscriber handlers that failed or panicked",
        )?;
        let timed_out = counter(
            "aasb_requests_timed_out_total",
            "Pending requests that got no reply before their deadline",
        )?;
        let reply_latency = Histogram::with_opts(HistogramOpts::new(
            "aasb_reply_latency_seconds",
            "Time between tracking a request and receiving its reply",
        ))?;
        registry.register(Box::new(reply_latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            correlated,
            unmatched,
            handler_failures,
            timed_out,
            reply_latency,
        })
    }

    /// Record a sent envelope.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received frame.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record an undecodable frame.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a correlated reply and its latency.
    pub fn observe_correlated(&self, latency: Duration) {
        self.correlated.inc();
        self.reply_latency.observe(latency.as_secs_f64());
    }

    /// Record an unmatched reply.
    pub fn observe_unmatched(&self) {
        self.unmatched.inc();
    }

    /// Record failed handler invocations.
    pub fn observe_handler_failures(&self, count: u64) {
        self.handler_failures.inc_by(count);
    }

    /// Record requests that timed out, swept or waiter-detected.
    pub fn observe_timed_out(&self, count: u64) {
        self.timed_out.inc_by(count);
    }
}
