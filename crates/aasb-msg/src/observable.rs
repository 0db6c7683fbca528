//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Latest-value broadcast cell."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Broadcast cell that replays its most recent value to every new subscriber.
#[derive(Debug)]
pub struct Latest<T> {
    sender: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Latest<T> {
    /// Cell holding `initial`.
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    /// Store `value`, notifying subscribers only when it changed.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Receiver that observes the current value immediately and every later
    /// change.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        let mut receiver = self.sender.subscribe();
        receiver.mark_changed();
        receiver
    }
}

/// Link state of the broker's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Envelopes can flow.
    Connected,
    /// The transport reported loss of the peer.
    Disconnected,
    /// The broker was shut down locally.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_sees_latest_value() {
        let cell = Latest::new(ConnectionState::Connected);
        assert!(cell.set(ConnectionState::Disconnected));
        let mut receiver = cell.subscribe();
        receiver.changed().await.expect("replayed");
        assert_eq!(*receiver.borrow_and_update(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn unchanged_value_does_not_notify() {
        let cell = Latest::new(1u32);
        let mut receiver = cell.subscribe();
        receiver.borrow_and_update();
        assert!(!cell.set(1));
        assert!(!receiver.has_changed().expect("sender alive"));
        assert!(cell.set(2));
        receiver.changed().await.expect("notified");
        assert_eq!(*receiver.borrow(), 2);
        assert_eq!(cell.get(), 2);
    }
}
