use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::event_sourcing::store::StoredRecord;
use super::SubscriptionScope;

// ============================================================================
// Append Notifier - Fan-out from the append path to live subscriptions
// ============================================================================
//
// Every committed batch is offered to each attached listener through its own
// bounded channel with try_send, so the append path never waits on a
// subscriber. A listener whose buffer is full is dropped on the spot and its
// overflow flag is raised; the delivery task drains what was buffered, sees
// the closed channel and reports the gap.
//
// ============================================================================

struct Listener {
    scope: SubscriptionScope,
    sender: mpsc::Sender<Arc<StoredRecord>>,
    overflowed: Arc<AtomicBool>,
}

/// Receiving half handed to a delivery task.
pub(crate) struct LiveFeed {
    pub receiver: mpsc::Receiver<Arc<StoredRecord>>,
    pub overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct Notifier {
    listeners: DashMap<Uuid, Listener>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, id: Uuid, scope: SubscriptionScope, capacity: usize) -> LiveFeed {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));

        self.listeners.insert(
            id,
            Listener {
                scope,
                sender,
                overflowed: overflowed.clone(),
            },
        );

        LiveFeed { receiver, overflowed }
    }

    pub(crate) fn detach(&self, id: Uuid) {
        self.listeners.remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Offer a committed batch to every matching listener without blocking.
    pub(crate) fn publish(&self, records: &[Arc<StoredRecord>]) {
        if self.listeners.is_empty() {
            return;
        }

        self.listeners.retain(|id, listener| {
            for record in records.iter().filter(|r| listener.scope.matches(r)) {
                match listener.sender.try_send(record.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        listener.overflowed.store(true, Ordering::Release);
                        tracing::warn!(
                            subscription_id = %id,
                            position = record.position,
                            "Subscriber buffer full, dropping live feed"
                        );
                        return false;
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::WireEnvelope;

    fn record(position: u64, stream_id: Uuid) -> Arc<StoredRecord> {
        Arc::new(StoredRecord {
            position,
            stream_id,
            version: position as i64,
            data: WireEnvelope::new(),
        })
    }

    #[tokio::test]
    async fn test_publish_filters_by_scope() {
        let notifier = Notifier::new();
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut stream_feed = notifier.attach(Uuid::new_v4(), SubscriptionScope::Stream(wanted), 8);
        let mut all_feed = notifier.attach(Uuid::new_v4(), SubscriptionScope::All, 8);

        notifier.publish(&[record(0, wanted), record(1, other)]);

        assert_eq!(stream_feed.receiver.recv().await.unwrap().position, 0);
        assert!(stream_feed.receiver.try_recv().is_err());

        assert_eq!(all_feed.receiver.recv().await.unwrap().position, 0);
        assert_eq!(all_feed.receiver.recv().await.unwrap().position, 1);
    }

    #[tokio::test]
    async fn test_publish_filters_by_event_type() {
        let notifier = Notifier::new();
        let stream_id = Uuid::new_v4();
        let tagged = |position: u64, tag: &str| {
            let mut stored = (*record(position, stream_id)).clone();
            stored.data.insert("eventType".to_string(), tag.to_string());
            Arc::new(stored)
        };

        let mut feed = notifier.attach(Uuid::new_v4(), SubscriptionScope::EventType("Shipped".to_string()), 8);

        notifier.publish(&[tagged(0, "Created"), tagged(1, "Shipped"), record(2, stream_id), tagged(3, "Shipped")]);

        assert_eq!(feed.receiver.recv().await.unwrap().position, 1);
        assert_eq!(feed.receiver.recv().await.unwrap().position, 3);
        assert!(feed.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_buffer_drops_listener_and_flags_overflow() {
        let notifier = Notifier::new();
        let mut feed = notifier.attach(Uuid::new_v4(), SubscriptionScope::All, 2);
        let stream_id = Uuid::new_v4();

        notifier.publish(&[record(0, stream_id), record(1, stream_id), record(2, stream_id)]);

        assert_eq!(notifier.listener_count(), 0);
        assert!(feed.overflowed.load(Ordering::Acquire));

        // Buffered records are still drained before the channel reports closed.
        assert_eq!(feed.receiver.recv().await.unwrap().position, 0);
        assert_eq!(feed.receiver.recv().await.unwrap().position, 1);
        assert!(feed.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_detach_removes_listener() {
        let notifier = Notifier::new();
        let id = Uuid::new_v4();
        let mut feed = notifier.attach(id, SubscriptionScope::All, 4);

        notifier.detach(id);
        notifier.publish(&[record(0, Uuid::new_v4())]);

        assert_eq!(notifier.listener_count(), 0);
        assert!(feed.receiver.recv().await.is_none());
        assert!(!feed.overflowed.load(Ordering::Acquire));
    }
}
