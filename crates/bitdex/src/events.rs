//! Typed in-process event bus.
//!
//! The engine publishes an [`Event`] after every successful mutation.
//! Subscribers hold a [`Subscription`]; dropping it unsubscribes. Delivery
//! is best-effort: a subscriber that falls more than the channel capacity
//! behind skips the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    DocumentInserted { id: u32, checksum: String },
    DocumentDeduplicated { id: u32, checksum: String },
    DocumentUpdated { id: u32 },
    DocumentRemoved { id: u32 },
    BlobStored { checksum: String, backends: Vec<String> },
    BlobDeleted { checksum: String },
    TreePathInserted { path: String, version: u64 },
    TreePathRemoved { path: String, version: u64 },
    TreePathMoved { from: String, to: String, version: u64 },
    LayerChanged { id: Uuid, name: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn publish(&self, event: Event) {
        tracing::trace!(?event, "publish");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscription_lifetime() {
        let bus = EventBus::default();
        bus.publish(Event::DocumentRemoved { id: 1 });

        let mut sub = bus.subscribe();
        assert_eq!(bus.tx.receiver_count(), 1);
        bus.publish(Event::DocumentUpdated { id: 1_000_001 });
        assert_eq!(
            sub.recv().await,
            Some(Event::DocumentUpdated { id: 1_000_001 })
        );
        assert!(sub.try_recv().is_none());

        drop(sub);
        assert_eq!(bus.tx.receiver_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(Event::TreePathMoved {
            from: "/a".to_string(),
            to: "/b/a".to_string(),
            version: 3,
        })
        .unwrap();
        assert_eq!(json["type"], "treePathMoved");
        assert_eq!(json["to"], "/b/a");
    }
}
