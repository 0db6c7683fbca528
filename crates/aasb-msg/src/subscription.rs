//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Topic/action subscription table."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::envelope::Envelope;

/// Callback invoked for every envelope routed to a subscription.
///
/// Handlers run on the transport callback thread and must return promptly;
/// long running work belongs on a separate worker.
pub trait MessageHandler: Send + Sync + 'static {
    /// Process a routed envelope.
    fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self(envelope)
    }
}

/// Box a closure as a shareable [`MessageHandler`].
pub fn handler_fn<F>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Opaque token returned by [`SubscriptionTable::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Numeric identifier, useful for logging.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A handler together with the handle it was registered under.
#[derive(Clone)]
pub struct RegisteredHandler {
    /// Registration handle.
    pub handle: SubscriptionHandle,
    /// The handler itself.
    pub handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TableState {
    // topic -> action -> handlers in registration order
    routes: HashMap<String, HashMap<String, Vec<RegisteredHandler>>>,
    index: HashMap<SubscriptionHandle, (String, String)>,
}

/// Exact-match (topic, action) routing table.
///
/// The table has its own lock; resolution clones the handler list so no
/// lock is held while handlers run.
#[derive(Default)]
pub struct SubscriptionTable {
    state: RwLock<TableState>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for the exact (topic, action) pair.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let topic = topic.into();
        let action = action.into();
        let mut state = self.state.write();
        state
            .routes
            .entry(topic.clone())
            .or_default()
            .entry(action.clone())
            .or_default()
            .push(RegisteredHandler { handle, handler });
        state.index.insert(handle, (topic, action));
        handle
    }

    /// Remove a registration. Unknown or already removed handles are a no-op.
    ///
    /// Returns whether a registration was removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut state = self.state.write();
        let Some((topic, action)) = state.index.remove(&handle) else {
            return false;
        };
        if let Some(actions) = state.routes.get_mut(&topic) {
            if let Some(handlers) = actions.get_mut(&action) {
                handlers.retain(|registered| registered.handle != handle);
                if handlers.is_empty() {
                    actions.remove(&action);
                }
            }
            if actions.is_empty() {
                state.routes.remove(&topic);
            }
        }
        true
    }

    /// Handlers registered for (topic, action), in registration order.
    pub fn resolve(&self, topic: &str, action: &str) -> Vec<RegisteredHandler> {
        let state = self.state.read();
        state
            .routes
            .get(topic)
            .and_then(|actions| actions.get(action))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `handle` is still registered.
    pub fn contains(&self, handle: SubscriptionHandle) -> bool {
        self.state.read().index.contains_key(&handle)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    /// Whether the table has no registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.routes.clear();
        state.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn MessageHandler> {
        let log = log.clone();
        handler_fn(move |_| {
            log.lock().push(name);
            Ok(())
        })
    }

    #[test]
    fn resolve_returns_handlers_in_registration_order() {
        let table = SubscriptionTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.subscribe("Navigation", "StartNavigation", recording(&log, "first"));
        table.subscribe("Navigation", "StartNavigation", recording(&log, "second"));
        table.subscribe("Navigation", "StartNavigation", recording(&log, "third"));

        let envelope = Envelope::new("Navigation", "StartNavigation", "{}");
        for registered in table.resolve("Navigation", "StartNavigation") {
            registered.handler.handle(&envelope).expect("handler ok");
        }
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn matching_is_exact() {
        let table = SubscriptionTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        table.subscribe("Navigation", "StartNavigation", recording(&log, "nav"));

        assert!(table.resolve("Navigation", "CancelNavigation").is_empty());
        assert!(table.resolve("navigation", "StartNavigation").is_empty());
        assert!(table.resolve("Navigation", "*").is_empty());
        assert!(table.resolve("*", "*").is_empty());
        assert_eq!(table.resolve("Navigation", "StartNavigation").len(), 1);
    }

    #[test]
    fn unsubscribe_removes_only_that_handle() {
        let table = SubscriptionTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = table.subscribe("T", "A", recording(&log, "first"));
        let second = table.subscribe("T", "A", recording(&log, "second"));

        assert!(table.unsubscribe(first));
        let remaining = table.resolve("T", "A");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].handle, second);
        assert!(!table.contains(first));
        assert!(table.contains(second));
    }

    #[test]
    fn unsubscribe_unknown_handle_is_noop() {
        let table = SubscriptionTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = table.subscribe("T", "A", recording(&log, "only"));
        assert!(table.unsubscribe(handle));
        assert!(!table.unsubscribe(handle));
        assert!(!table.unsubscribe(SubscriptionHandle(9_999)));
        assert!(table.is_empty());
    }

    #[test]
    fn handles_are_unique() {
        let table = SubscriptionTable::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = table.subscribe("T", "A", recording(&log, "a"));
        let b = table.subscribe("T", "B", recording(&log, "b"));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        table.clear();
        assert!(table.is_empty());
    }
}
