//! Session event bus.
//!
//! The gateway publishes here when the server rejects the bearer token; the
//! session store (or any other observer) subscribes. Neither side holds a
//! reference to the other.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The stored token was rejected and has been removed from storage.
    Invalidated,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Returns how many observers received the event.
    pub fn publish(&self, event: SessionEvent) -> usize {
        // No subscribers is not an error.
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_sees_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(SessionEvent::Invalidated), 2);
        assert_eq!(a.try_recv().unwrap(), SessionEvent::Invalidated);
        assert_eq!(b.try_recv().unwrap(), SessionEvent::Invalidated);
        assert!(a.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        assert_eq!(EventBus::new().publish(SessionEvent::Invalidated), 0);
    }
}
