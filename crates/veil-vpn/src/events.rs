//! Event Bus
//!
//! Process-wide notifications for status and bootstrap progress.

use tokio::sync::broadcast;

/// Default number of buffered events per subscriber
const DEFAULT_CAPACITY: usize = 64;

/// Tunnel notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Connection, relay or configuration state changed; re-read it
    StatusChanged,
    /// Bootstrap percentage of the current attempt
    Progress(u8),
}

/// Broadcast publish point
///
/// Slow subscribers lose the oldest events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber; no subscribers is fine
    pub fn publish(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(TunnelEvent::Progress(10));
        bus.publish(TunnelEvent::StatusChanged);

        assert_eq!(first.recv().await.unwrap(), TunnelEvent::Progress(10));
        assert_eq!(first.recv().await.unwrap(), TunnelEvent::StatusChanged);
        assert_eq!(second.recv().await.unwrap(), TunnelEvent::Progress(10));
        assert_eq!(second.recv().await.unwrap(), TunnelEvent::StatusChanged);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(0);
        bus.publish(TunnelEvent::StatusChanged);

        let mut late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }
}
