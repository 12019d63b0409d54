use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::event_sourcing::core::{GlobalPosition, Version, WireEnvelope, NO_STREAM};
use super::errors::StorageError;

// ============================================================================
// Log Storage Port - Ordered, Durable Append-and-Read Primitive
// ============================================================================
//
// The stream store and the global log only need:
// 1. A conditional, all-or-nothing append of one stream's batch
// 2. Ordered reads per stream and across all streams
// 3. The current head of a stream and of the global log
//
// Deployment of a durable backend is outside this crate; InMemoryLog is the
// reference implementation used by tests and the demo.
//
// ============================================================================

/// One persisted envelope with its stream coordinates and global position.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub position: GlobalPosition,
    pub stream_id: Uuid,
    pub version: Version,
    pub data: WireEnvelope,
}

#[async_trait]
pub trait LogStorage: Send + Sync + 'static {
    /// Append one stream's batch atomically.
    ///
    /// Records carry contiguous versions starting right after the stream's
    /// current version and contiguous positions starting at the next global
    /// position; anything else is rejected without mutation.
    async fn append(&self, records: Vec<StoredRecord>) -> Result<Vec<Arc<StoredRecord>>, StorageError>;

    /// Records of one stream with `from_version <= version <= to_version`.
    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: Version,
        to_version: Option<Version>,
        max_count: Option<usize>,
    ) -> Result<Vec<Arc<StoredRecord>>, StorageError>;

    /// Records of every stream from `from_position` on, in position order.
    async fn read_all(
        &self,
        from_position: GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<Vec<Arc<StoredRecord>>, StorageError>;

    /// Version of the last record in the stream, or NO_STREAM.
    async fn stream_version(&self, stream_id: Uuid) -> Result<Version, StorageError>;

    /// Position the next appended record will receive.
    async fn next_position(&self) -> Result<GlobalPosition, StorageError>;
}

// ============================================================================
// In-Memory Log
// ============================================================================
//
// Records live in fixed-size chunks: full chunks are sealed into shared,
// immutable slices and only the last chunk is still growing. The global log
// and every stream keep their own chunk list over the same Arc records.
//
// A reader holds the read lock just long enough to take handles to the
// chunks covering its range (plus a copy of the partial tail), then builds
// its result with the lock released. The writer therefore waits at most
// one chunk's worth of copying, whatever the size of a concurrent read.
//
// ============================================================================

const CHUNK_SIZE: usize = 1024;

type Chunk = Arc<[Arc<StoredRecord>]>;

#[derive(Default)]
struct ChunkedRecords {
    sealed: Vec<Chunk>,
    tail: Vec<Arc<StoredRecord>>,
}

impl ChunkedRecords {
    fn len(&self) -> usize {
        self.sealed.len() * CHUNK_SIZE + self.tail.len()
    }

    fn push(&mut self, record: Arc<StoredRecord>) {
        self.tail.push(record);
        if self.tail.len() == CHUNK_SIZE {
            let full = std::mem::replace(&mut self.tail, Vec::with_capacity(CHUNK_SIZE));
            self.sealed.push(full.into());
        }
    }

    /// Handles to the records in `start..end`, resolved later without the lock.
    fn snapshot(&self, start: usize, end: usize) -> Snapshot {
        let end = end.min(self.len());
        if start >= end {
            return Snapshot::default();
        }

        let first = start / CHUNK_SIZE;
        let last = (end - 1) / CHUNK_SIZE;
        let chunks = (first..=last)
            .map(|index| match self.sealed.get(index) {
                Some(chunk) => chunk.clone(),
                None => Chunk::from(&self.tail[..end - index * CHUNK_SIZE]),
            })
            .collect();

        Snapshot {
            chunks,
            skip: start - first * CHUNK_SIZE,
            len: end - start,
        }
    }
}

#[derive(Default)]
struct Snapshot {
    chunks: Vec<Chunk>,
    skip: usize,
    len: usize,
}

impl Snapshot {
    fn into_records(self) -> Vec<Arc<StoredRecord>> {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter())
            .skip(self.skip)
            .take(self.len)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct LogIndex {
    records: ChunkedRecords,
    streams: HashMap<Uuid, ChunkedRecords>,
}

impl LogIndex {
    fn stream_version(&self, stream_id: &Uuid) -> Version {
        self.streams
            .get(stream_id)
            .map(|records| records.len() as Version - 1)
            .unwrap_or(NO_STREAM)
    }
}

#[derive(Default)]
pub struct InMemoryLog {
    index: RwLock<LogIndex>,
    offline: AtomicBool,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StorageError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.index.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory log is offline".to_string()));
        }
        Ok(())
    }

    fn stream_snapshot(
        &self,
        stream_id: Uuid,
        from_version: Version,
        to_version: Option<Version>,
        max_count: Option<usize>,
    ) -> Snapshot {
        let index = self.index.read();
        let records = match index.streams.get(&stream_id) {
            Some(records) => records,
            None => return Snapshot::default(),
        };

        let start = from_version.max(0) as usize;
        let end = match to_version {
            Some(to) if to < 0 => 0,
            Some(to) => to as usize + 1,
            None => records.len(),
        };
        let end = end.min(start.saturating_add(max_count.unwrap_or(usize::MAX)));

        records.snapshot(start, end)
    }

    fn global_snapshot(&self, from_position: GlobalPosition, max_count: Option<usize>) -> Snapshot {
        let index = self.index.read();
        let start = from_position as usize;
        let end = start.saturating_add(max_count.unwrap_or(usize::MAX));

        index.records.snapshot(start, end)
    }
}

#[async_trait]
impl LogStorage for InMemoryLog {
    async fn append(&self, records: Vec<StoredRecord>) -> Result<Vec<Arc<StoredRecord>>, StorageError> {
        self.ensure_online()?;

        let first = records
            .first()
            .ok_or_else(|| StorageError::InvalidBatch("empty batch".to_string()))?;
        let stream_id = first.stream_id;

        for (offset, record) in records.iter().enumerate() {
            if record.stream_id != stream_id
                || record.version != first.version + offset as Version
                || record.position != first.position + offset as GlobalPosition
            {
                return Err(StorageError::InvalidBatch(format!(
                    "record {} breaks stream/version/position contiguity",
                    offset
                )));
            }
        }
        let committed: Vec<Arc<StoredRecord>> = records.into_iter().map(Arc::new).collect();

        let mut index = self.index.write();

        let next_position = index.records.len() as GlobalPosition;
        if committed[0].position != next_position {
            return Err(StorageError::PositionMismatch {
                expected: committed[0].position,
                actual: next_position,
            });
        }

        let current = index.stream_version(&stream_id);
        if committed[0].version != current + 1 {
            return Err(StorageError::Conflict { stream_id, actual: current });
        }

        let stream = index.streams.entry(stream_id).or_default();
        for record in &committed {
            stream.push(record.clone());
        }
        for record in &committed {
            index.records.push(record.clone());
        }

        Ok(committed)
    }

    async fn read_stream(
        &self,
        stream_id: Uuid,
        from_version: Version,
        to_version: Option<Version>,
        max_count: Option<usize>,
    ) -> Result<Vec<Arc<StoredRecord>>, StorageError> {
        self.ensure_online()?;
        Ok(self
            .stream_snapshot(stream_id, from_version, to_version, max_count)
            .into_records())
    }

    async fn read_all(
        &self,
        from_position: GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<Vec<Arc<StoredRecord>>, StorageError> {
        self.ensure_online()?;
        Ok(self.global_snapshot(from_position, max_count).into_records())
    }

    async fn stream_version(&self, stream_id: Uuid) -> Result<Version, StorageError> {
        self.ensure_online()?;
        Ok(self.index.read().stream_version(&stream_id))
    }

    async fn next_position(&self) -> Result<GlobalPosition, StorageError> {
        self.ensure_online()?;
        Ok(self.index.read().records.len() as GlobalPosition)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
