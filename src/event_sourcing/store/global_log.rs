use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event_sourcing::core::{GlobalPosition, Version, WireEnvelope};
use crate::event_sourcing::subscription::Notifier;
use super::errors::StorageError;
use super::storage::{LogStorage, StoredRecord};

// ============================================================================
// Global Log - Single Position Counter Across All Streams
// ============================================================================
//
// Every append of every stream funnels through `commit`, which holds the
// sequencer lock while it:
// 1. Assigns the next contiguous global positions to the batch
// 2. Persists the batch through the storage port
// 3. Hands the committed records to the notifier
//
// Step 3 runs under the same lock so live listeners observe records in true
// position order. This lock is the store's only cross-stream serialization
// point; per-stream version checks happen before it is taken.
//
// ============================================================================

/// One stream's event on its way into the log, before a position is known.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub stream_id: Uuid,
    pub version: Version,
    pub data: WireEnvelope,
}

pub struct GlobalLog {
    storage: Arc<dyn LogStorage>,
    /// Next position to assign; `None` until loaded from storage.
    sequencer: Mutex<Option<GlobalPosition>>,
    notifier: Arc<Notifier>,
}

impl GlobalLog {
    pub fn new(storage: Arc<dyn LogStorage>, notifier: Arc<Notifier>) -> Self {
        Self {
            storage,
            sequencer: Mutex::new(None),
            notifier,
        }
    }

    pub fn storage(&self) -> &Arc<dyn LogStorage> {
        &self.storage
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Assign positions to `pending`, persist it and notify listeners.
    pub async fn commit(&self, pending: Vec<PendingRecord>) -> Result<Vec<Arc<StoredRecord>>, StorageError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut sequencer = self.sequencer.lock().await;

        let next = match *sequencer {
            Some(next) => next,
            None => self.storage.next_position().await?,
        };

        let records: Vec<StoredRecord> = pending
            .into_iter()
            .enumerate()
            .map(|(offset, record)| StoredRecord {
                position: next + offset as GlobalPosition,
                stream_id: record.stream_id,
                version: record.version,
                data: record.data,
            })
            .collect();
        let count = records.len() as GlobalPosition;

        match self.storage.append(records).await {
            Ok(committed) => {
                *sequencer = Some(next + count);
                self.notifier.publish(&committed);
                Ok(committed)
            }
            Err(e) => {
                // Storage may have moved under us; reload on next commit.
                *sequencer = None;
                Err(e)
            }
        }
    }

    pub async fn read_all(
        &self,
        from_position: GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<Vec<Arc<StoredRecord>>, StorageError> {
        self.storage.read_all(from_position, max_count).await
    }

    /// Position the next committed record will receive.
    pub async fn head_position(&self) -> Result<GlobalPosition, StorageError> {
        self.storage.next_position().await
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::store::InMemoryLog;
    use crate::event_sourcing::subscription::SubscriptionScope;

    fn pending(stream_id: Uuid, version: Version) -> PendingRecord {
        PendingRecord {
            stream_id,
            version,
            data: WireEnvelope::new(),
        }
    }

    fn global_log() -> (Arc<InMemoryLog>, Arc<Notifier>, GlobalLog) {
        let storage = Arc::new(InMemoryLog::new());
        let notifier = Arc::new(Notifier::new());
        let log = GlobalLog::new(storage.clone(), notifier.clone());
        (storage, notifier, log)
    }

    #[tokio::test]
    async fn test_positions_are_contiguous_across_streams() {
        let (_, _, log) = global_log();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = log.commit(vec![pending(a, 0), pending(a, 1)]).await.unwrap();
        let second = log.commit(vec![pending(b, 0)]).await.unwrap();

        assert_eq!(first.iter().map(|r| r.position).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second[0].position, 2);
        assert_eq!(log.head_position().await.unwrap(), 3);

        let all = log.read_all(0, None).await.unwrap();
        let streams: Vec<Uuid> = all.iter().map(|r| r.stream_id).collect();
        assert_eq!(streams, vec![a, a, b]);
    }

    #[tokio::test]
    async fn test_commit_notifies_listeners() {
        let (_, notifier, log) = global_log();
        let mut feed = notifier.attach(Uuid::new_v4(), SubscriptionScope::All, 4);

        log.commit(vec![pending(Uuid::new_v4(), 0)]).await.unwrap();

        let record = feed.receiver.recv().await.unwrap();
        assert_eq!(record.position, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_does_not_advance_or_notify() {
        let (storage, notifier, log) = global_log();
        let mut feed = notifier.attach(Uuid::new_v4(), SubscriptionScope::All, 4);
        let stream_id = Uuid::new_v4();

        // Version 1 on an empty stream is rejected by storage.
        let result = log.commit(vec![pending(stream_id, 1)]).await;
        assert!(matches!(result, Err(StorageError::Conflict { .. })));
        assert!(feed.receiver.try_recv().is_err());

        storage.set_offline(true);
        let result = log.commit(vec![pending(stream_id, 0)]).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));

        storage.set_offline(false);
        let committed = log.commit(vec![pending(stream_id, 0)]).await.unwrap();
        assert_eq!(committed[0].position, 0);
    }

    #[tokio::test]
    async fn test_empty_commit_is_noop() {
        let (storage, _, log) = global_log();
        assert!(log.commit(Vec::new()).await.unwrap().is_empty());
        assert!(storage.is_empty());
    }
}
