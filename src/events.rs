//! Best-effort lock lifecycle notifications (spec.md §4.I).
//!
//! Published only after the owning transaction has committed, so a
//! subscriber never observes a lock that a concurrent reader wouldn't also
//! see if it queried the backend right away.

use tokio::sync::broadcast;

use crate::lock::ActiveLock;

#[derive(Debug, Clone)]
pub enum LockEvent {
    Added(ActiveLock),
    Refreshed(ActiveLock),
    Released(ActiveLock),
}

/// Fan-out channel for lock events. Cloning shares the same underlying
/// broadcast channel.
#[derive(Debug, Clone)]
pub struct EventChannel {
    sender: broadcast::Sender<LockEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> EventChannel {
        let (sender, _) = broadcast::channel(capacity);
        EventChannel { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; delivery is fire-and-forget. No receivers is not
    /// an error — it just means nobody is watching right now.
    pub fn publish(&self, event: LockEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventChannel {
    fn default() -> EventChannel {
        EventChannel::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lock() -> ActiveLock {
        ActiveLock::new(
            crate::webpath::LockPath::parse("/a").unwrap(),
            "/a".to_string(),
            false,
            None,
            crate::lock::LockAccessType::Write,
            crate::lock::LockShareMode::Exclusive,
            Duration::from_secs(60),
            "opaquelocktoken:1".to_string(),
            chrono::Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let channel = EventChannel::default();
        let mut rx = channel.subscribe();
        channel.publish(LockEvent::Added(lock()));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, LockEvent::Added(_)));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let channel = EventChannel::default();
        channel.publish(LockEvent::Released(lock()));
    }
}
