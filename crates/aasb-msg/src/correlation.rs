//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Request/reply correlation tracking."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Request/reply correlation.
//!
//! A producer calls [`CorrelationTracker::track`] *before* publishing the
//! request so that a fast reply cannot overtake the registration. Every
//! pending request resolves exactly once: removal from the pending map is the
//! token that decides which of reply, timeout or cancellation wins.
//!
//! Waiters that notice their own deadline report it through the observer
//! installed with [`CorrelationTracker::set_timeout_observer`], so the same
//! counters see both swept and self-detected timeouts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::envelope::Envelope;

/// Why a pending request completed without a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    /// The deadline elapsed before a reply arrived.
    #[error("no reply to {message_id} within {timeout:?}")]
    Timeout {
        /// Identifier of the request.
        message_id: String,
        /// Timeout the request was tracked with.
        timeout: Duration,
    },
    /// The caller lost interest.
    #[error("request {message_id} was cancelled")]
    Cancelled {
        /// Identifier of the request.
        message_id: String,
    },
    /// The transport went away while the request was pending.
    #[error("transport disconnected while awaiting reply to {message_id}")]
    Disconnected {
        /// Identifier of the request.
        message_id: String,
    },
    /// The broker shut down while the request was pending.
    #[error("broker shut down while awaiting reply to {message_id}")]
    Shutdown {
        /// Identifier of the request.
        message_id: String,
    },
}

/// Registration failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// Another in-flight request already uses this message id.
    #[error("message id {0} is already awaiting a reply")]
    AlreadyTracked(String),
}

/// Reason used when failing every pending request at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Transport disconnected.
    Disconnected,
    /// Broker shutdown.
    Shutdown,
}

type Outcome = Result<Envelope, ReplyError>;

/// Callback told about every request a waiter timed out on its own.
pub type TimeoutObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct ReplySlot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
    // Stores a permit when no async waiter is parked yet.
    woken: Notify,
}

impl ReplySlot {
    fn complete(&self, outcome: Outcome) {
        let mut guard = self.outcome.lock();
        if guard.is_none() {
            *guard = Some(outcome);
        }
        self.ready.notify_all();
        self.woken.notify_one();
    }
}

struct PendingRequest {
    slot: Arc<ReplySlot>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    tracked_at: Instant,
}

/// Reply delivered to a waiter along with how long it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// Time between `track` and resolution.
    pub latency: Duration,
}

/// Table of requests awaiting a reply.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: Mutex<HashMap<String, PendingRequest>>,
    timeout_observer: Mutex<Option<TimeoutObserver>>,
}

impl CorrelationTracker {
    /// Create an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Report waiter-detected timeouts to `observer`.
    ///
    /// Sweeps through [`CorrelationTracker::expire`] are not reported here;
    /// their caller already holds the expired ids.
    pub fn set_timeout_observer(&self, observer: impl Fn(&str) + Send + Sync + 'static) {
        *self.timeout_observer.lock() = Some(Arc::new(observer));
    }

    fn observe_timeout(&self, message_id: &str) {
        let observer = self.timeout_observer.lock().clone();
        if let Some(observer) = observer {
            observer(message_id);
        }
    }

    /// Register interest in a reply to `message_id`.
    ///
    /// `timeout` of `None` waits until resolved, cancelled or aborted.
    pub fn track(
        self: &Arc<Self>,
        message_id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Waiter, CorrelationError> {
        let message_id = message_id.into();
        let now = Instant::now();
        let deadline = timeout.map(|timeout| now + timeout);
        let slot = Arc::new(ReplySlot::default());

        let mut pending = self.pending.lock();
        if pending.contains_key(&message_id) {
            return Err(CorrelationError::AlreadyTracked(message_id));
        }
        pending.insert(
            message_id.clone(),
            PendingRequest {
                slot: slot.clone(),
                timeout,
                deadline,
                tracked_at: now,
            },
        );
        drop(pending);

        Ok(Waiter {
            message_id,
            timeout,
            deadline,
            slot,
            tracker: self.clone(),
        })
    }

    /// Complete the waiter tracked under `reply_to_id` with `envelope`.
    ///
    /// Returns `None` when nothing is tracked under that id (unknown, already
    /// resolved, timed out or cancelled).
    pub fn resolve(&self, reply_to_id: &str, envelope: Envelope) -> Option<Resolution> {
        let request = self.pending.lock().remove(reply_to_id)?;
        let latency = request.tracked_at.elapsed();
        request.slot.complete(Ok(envelope));
        Some(Resolution { latency })
    }

    /// Fail every overdue waiter with [`ReplyError::Timeout`].
    ///
    /// Returns the ids that expired.
    pub fn expire(&self) -> Vec<String> {
        self.expire_at(Instant::now())
    }

    fn expire_at(&self, now: Instant) -> Vec<String> {
        let overdue: Vec<(String, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| request.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        overdue
            .into_iter()
            .map(|(message_id, request)| {
                request.slot.complete(Err(ReplyError::Timeout {
                    message_id: message_id.clone(),
                    timeout: request.timeout.unwrap_or_default(),
                }));
                message_id
            })
            .collect()
    }

    /// Withdraw interest in `message_id`. Returns whether this call won.
    pub fn cancel(&self, message_id: &str) -> bool {
        let Some(request) = self.pending.lock().remove(message_id) else {
            return false;
        };
        request.slot.complete(Err(ReplyError::Cancelled {
            message_id: message_id.to_owned(),
        }));
        true
    }

    // Removes the entry only if it still belongs to `slot`, so a waiter
    // dropped late cannot cancel a newer request that reused its id.
    fn withdraw(&self, message_id: &str, slot: &Arc<ReplySlot>) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        match pending.get(message_id) {
            Some(request) if Arc::ptr_eq(&request.slot, slot) => pending.remove(message_id),
            _ => None,
        }
    }

    /// Fail every pending request. Returns how many were aborted.
    pub fn abort_all(&self, reason: AbortReason) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (message_id, request) in drained {
            let error = match reason {
                AbortReason::Disconnected => ReplyError::Disconnected { message_id },
                AbortReason::Shutdown => ReplyError::Shutdown { message_id },
            };
            request.slot.complete(Err(error));
        }
        count
    }

    /// Whether a reply to `message_id` is still awaited.
    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .lock()
            .values()
            .filter_map(|request| request.deadline)
            .min()
    }
}

/// Single-resolution handle for a tracked request.
///
/// Dropping an unresolved waiter cancels the request.
pub struct Waiter {
    message_id: String,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    slot: Arc<ReplySlot>,
    tracker: Arc<CorrelationTracker>,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("message_id", &self.message_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Waiter {
    /// Identifier of the request this waiter belongs to.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Non-blocking look at the outcome. The outcome stays in place for a
    /// later [`Waiter::wait`].
    pub fn peek(&self) -> Option<Result<Envelope, ReplyError>> {
        self.slot.outcome.lock().clone()
    }

    /// Whether an outcome is available.
    pub fn is_resolved(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Block until the reply arrives or the request fails.
    pub fn wait(self) -> Result<Envelope, ReplyError> {
        let mut outcome = self.slot.outcome.lock();
        let mut overdue = false;
        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            match self.deadline {
                Some(deadline) if !overdue && Instant::now() < deadline => {
                    self.slot.ready.wait_until(&mut outcome, deadline);
                }
                Some(_) if !overdue => {
                    if let Some(error) = self.time_out() {
                        return Err(error);
                    }
                    overdue = true;
                }
                _ => self.slot.ready.wait(&mut outcome),
            }
        }
    }

    /// Await the outcome from async code without blocking the executor.
    ///
    /// Dropping the future drops the waiter, which cancels the request.
    pub async fn wait_async(self) -> Result<Envelope, ReplyError> {
        let mut overdue = false;
        loop {
            if let Some(result) = self.take_outcome() {
                return result;
            }
            let woken = self.slot.woken.notified();
            match self.deadline {
                Some(deadline) if !overdue => {
                    if tokio::time::timeout_at(deadline.into(), woken).await.is_err() {
                        if let Some(error) = self.time_out() {
                            return Err(error);
                        }
                        overdue = true;
                    }
                }
                _ => woken.await,
            }
        }
    }

    fn take_outcome(&self) -> Option<Outcome> {
        self.slot.outcome.lock().take()
    }

    // Winning the withdrawal means no reply can land any more; losing it
    // means a resolver already owns the entry and is about to fill the slot.
    fn time_out(&self) -> Option<ReplyError> {
        self.tracker.withdraw(&self.message_id, &self.slot)?;
        self.tracker.observe_timeout(&self.message_id);
        Some(ReplyError::Timeout {
            message_id: self.message_id.clone(),
            timeout: self.timeout.unwrap_or_default(),
        })
    }

    /// Withdraw the request. Returns whether the cancellation won the race
    /// against a concurrently arriving reply.
    pub fn cancel(self) -> bool {
        self.withdraw_with(|message_id| ReplyError::Cancelled { message_id })
    }

    fn withdraw_with(&self, error: impl FnOnce(String) -> ReplyError) -> bool {
        match self.tracker.withdraw(&self.message_id, &self.slot) {
            Some(request) => {
                request.slot.complete(Err(error(self.message_id.clone())));
                true
            }
            None => false,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.withdraw_with(|message_id| ReplyError::Cancelled { message_id });
    }
}
