//! Domain Event Bus
//!
//! Typed broadcast channel for detection outcomes. Consumers subscribe for
//! their own receiver; a publish with no subscribers is silently dropped.

use crate::alerts::Alert;
use crate::detectors::Finding;
use crate::ioc::IocEntry;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    AlertCreated { alert: Alert },
    AnomalyDetected { finding: Finding },
    IocMatch { event_id: String, indicator: IocEntry },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget: a send error only means nobody is listening.
    pub fn publish(&self, event: DomainEvent) {
        trace!(subscribers = self.sender.receiver_count(), "publishing domain event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioc::IocType;
    use chrono::Utc;

    fn indicator() -> IocEntry {
        IocEntry {
            id: "ioc-1".to_string(),
            ioc_type: IocType::Domain,
            value: "evil.example.com".to_string(),
            feed_id: "feed-1".to_string(),
            confidence: 90,
            tlp: None,
            description: None,
            tags: vec![],
            active: true,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::IocMatch {
            event_id: "evt-1".to_string(),
            indicator: indicator(),
        });

        match rx.recv().await.unwrap() {
            DomainEvent::IocMatch { event_id, indicator } => {
                assert_eq!(event_id, "evt-1");
                assert_eq!(indicator.value, "evil.example.com");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        tokio_test::block_on(async {
            let bus = EventBus::new(8);
            // Must not panic or block.
            bus.publish(DomainEvent::IocMatch {
                event_id: "evt-2".to_string(),
                indicator: indicator(),
            });
            assert_eq!(bus.subscriber_count(), 0);
        });
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_a_copy() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(DomainEvent::IocMatch {
            event_id: "evt-3".to_string(),
            indicator: indicator(),
        });

        assert!(matches!(a.recv().await.unwrap(), DomainEvent::IocMatch { .. }));
        assert!(matches!(b.recv().await.unwrap(), DomainEvent::IocMatch { .. }));
    }
}
