use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::EventStoreConfig;
use crate::event_sourcing::core::{
    DomainEvent, EventSerializer, GlobalPosition, NewEvent, RecordedEvent, TypeRegistry, Version,
};
use crate::event_sourcing::subscription::{
    ErrorCallback, EventHandler, Notifier, Subscription, SubscriptionManager, SubscriptionScope,
};
use crate::metrics::EventStoreMetrics;
use super::errors::{ConcurrencyError, EventStoreError, StorageError};
use super::global_log::{GlobalLog, PendingRecord};
use super::storage::{InMemoryLog, LogStorage, StoredRecord};

// ============================================================================
// Generic Event Store - Streams, Global Log and Subscriptions
// ============================================================================
//
// This is a GENERIC event store that works with ANY event type registered in
// a TypeRegistry.
//
// Type Parameter:
// - `E`: The domain event type (must implement DomainEvent trait)
//
// Responsibilities:
// 1. Append events to a stream under optimistic concurrency
// 2. Assign global positions through the GlobalLog
// 3. Read streams and the global log back in order
// 4. Start catch-up/live subscriptions
//
// Appends to one stream are serialized by a per-stream lock; appends to
// different streams only meet inside GlobalLog::commit.
//
// ============================================================================

pub struct EventStore<E: DomainEvent> {
    inner: Arc<StoreInner<E>>,
}

struct StoreInner<E: DomainEvent> {
    log: GlobalLog,
    serializer: EventSerializer<E>,
    subscriptions: SubscriptionManager<E>,
    metrics: Arc<EventStoreMetrics>,
    stream_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Last committed version per stream; `None` when disabled.
    version_cache: Option<DashMap<Uuid, Version>>,
    shutting_down: AtomicBool,
}

impl<E: DomainEvent> Clone for EventStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: DomainEvent> EventStore<E> {
    pub fn new(
        storage: Arc<dyn LogStorage>,
        registry: Arc<TypeRegistry<E>>,
        config: &EventStoreConfig,
    ) -> Self {
        let serializer = EventSerializer::new(registry);
        let metrics = Arc::new(EventStoreMetrics::default());
        let notifier = Arc::new(Notifier::new());

        let subscriptions = SubscriptionManager::new(
            storage.clone(),
            serializer.clone(),
            notifier.clone(),
            metrics.clone(),
            config,
        );

        Self {
            inner: Arc::new(StoreInner {
                log: GlobalLog::new(storage, notifier),
                serializer,
                subscriptions,
                metrics,
                stream_locks: DashMap::new(),
                version_cache: config.version_cache_enabled.then(DashMap::new),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Store over a fresh InMemoryLog with default configuration.
    pub fn in_memory(registry: Arc<TypeRegistry<E>>) -> Self {
        Self::new(Arc::new(InMemoryLog::new()), registry, &EventStoreConfig::default())
    }

    pub fn serializer(&self) -> &EventSerializer<E> {
        &self.inner.serializer
    }

    pub fn metrics(&self) -> &EventStoreMetrics {
        &self.inner.metrics
    }

    pub fn subscriptions(&self) -> &SubscriptionManager<E> {
        &self.inner.subscriptions
    }

    // ========================================================================
    // Appends
    // ========================================================================

    /// Append one event; returns the stream's new version.
    pub async fn append_to_stream(
        &self,
        stream_id: Uuid,
        expected_version: Version,
        event: NewEvent<E>,
    ) -> Result<Version, EventStoreError> {
        self.append_batch_to_stream(stream_id, expected_version, vec![event]).await
    }

    /// Append a batch atomically; returns the version of its last event.
    ///
    /// Events receive consecutive versions starting at `expected_version + 1`.
    /// An empty batch appends nothing and returns the current version.
    pub async fn append_batch_to_stream(
        &self,
        stream_id: Uuid,
        expected_version: Version,
        events: Vec<NewEvent<E>>,
    ) -> Result<Version, EventStoreError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(EventStoreError::ShuttingDown);
        }

        if let Some(event) = events.iter().find(|event| event.aggregate_id != stream_id) {
            return Err(EventStoreError::AggregateMismatch {
                stream_id,
                aggregate_id: event.aggregate_id,
            });
        }

        if events.is_empty() {
            return self.get_stream_version(stream_id).await;
        }

        let started = Instant::now();
        let event_count = events.len();

        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let result = self.append_locked(stream_id, expected_version, events).await;

        match &result {
            Ok(_) => self
                .inner
                .metrics
                .record_append(event_count, started.elapsed().as_secs_f64()),
            Err(EventStoreError::Concurrency(_)) => self.inner.metrics.record_conflict(),
            Err(_) => self.inner.metrics.record_append_failure(),
        }

        result
    }

    async fn append_locked(
        &self,
        stream_id: Uuid,
        expected_version: Version,
        events: Vec<NewEvent<E>>,
    ) -> Result<Version, EventStoreError> {
        let current_version = self.current_version(stream_id, expected_version).await?;
        if current_version != expected_version {
            tracing::warn!(
                stream_id = %stream_id,
                expected_version = expected_version,
                actual_version = current_version,
                "Version conflict, append rejected"
            );
            return Err(ConcurrencyError {
                stream_id,
                expected: expected_version,
                actual: current_version,
            }
            .into());
        }

        let serializer = &self.inner.serializer;
        let mut pending = Vec::with_capacity(events.len());
        let mut new_version = expected_version;

        for event in events {
            new_version += 1;

            let event_type = serializer.event_type_of(&event.payload)?;
            let envelope = event.into_envelope(new_version, event_type);
            let data = serializer.serialize(&envelope)?;

            pending.push(PendingRecord {
                stream_id,
                version: new_version,
                data,
            });
        }
        let event_count = pending.len();

        match self.inner.log.commit(pending).await {
            Ok(committed) => {
                self.cache_version(stream_id, new_version);

                tracing::info!(
                    stream_id = %stream_id,
                    expected_version = expected_version,
                    new_version = new_version,
                    position = committed.first().map(|record| record.position),
                    event_count = event_count,
                    "Appended events to stream"
                );

                Ok(new_version)
            }
            Err(StorageError::Conflict { actual, .. }) => {
                self.invalidate_version(stream_id);
                tracing::warn!(
                    stream_id = %stream_id,
                    expected_version = expected_version,
                    actual_version = actual,
                    "Storage rejected append on version"
                );
                Err(ConcurrencyError {
                    stream_id,
                    expected: expected_version,
                    actual,
                }
                .into())
            }
            Err(e) => {
                self.invalidate_version(stream_id);
                tracing::error!(stream_id = %stream_id, error = %e, "Append failed");
                Err(e.into())
            }
        }
    }

    fn stream_lock(&self, stream_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .stream_locks
            .entry(stream_id)
            .or_default()
            .value()
            .clone()
    }

    /// Current version of the stream for an append expecting `expected_version`.
    ///
    /// A cached version is trusted only when it agrees with the caller; any
    /// disagreement is settled by storage and counts as a miss.
    async fn current_version(&self, stream_id: Uuid, expected_version: Version) -> Result<Version, EventStoreError> {
        if let Some(cache) = &self.inner.version_cache {
            let cached = cache.get(&stream_id).map(|entry| *entry.value());
            let hit = cached == Some(expected_version);
            self.inner.metrics.record_cache_lookup(hit);
            if hit {
                return Ok(expected_version);
            }
        }

        let version = self.inner.log.storage().stream_version(stream_id).await?;
        self.cache_version(stream_id, version);
        Ok(version)
    }

    fn cache_version(&self, stream_id: Uuid, version: Version) {
        if let Some(cache) = &self.inner.version_cache {
            cache.insert(stream_id, version);
        }
    }

    fn invalidate_version(&self, stream_id: Uuid) {
        if let Some(cache) = &self.inner.version_cache {
            cache.remove(&stream_id);
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Events of one stream with `from_version <= version <= to_version`.
    pub async fn read_from_stream(
        &self,
        stream_id: Uuid,
        from_version: Version,
        to_version: Option<Version>,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        let records = self.read_stream_envelopes(stream_id, from_version, to_version).await?;
        self.decode_all(&records)
    }

    /// Raw wire records of one stream, without running any decoder.
    pub async fn read_stream_envelopes(
        &self,
        stream_id: Uuid,
        from_version: Version,
        to_version: Option<Version>,
    ) -> Result<Vec<Arc<StoredRecord>>, EventStoreError> {
        let records = self
            .inner
            .log
            .storage()
            .read_stream(stream_id, from_version, to_version, None)
            .await?;

        self.inner.metrics.record_read("stream", records.len());
        tracing::debug!(
            stream_id = %stream_id,
            from_version = from_version,
            count = records.len(),
            "Read stream"
        );

        Ok(records)
    }

    /// Events of every stream from `from_position` on, in global order.
    pub async fn read_all_events(
        &self,
        from_position: GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        let records = self.read_all_envelopes(from_position, max_count).await?;
        self.decode_all(&records)
    }

    /// Raw wire records of the global log, without running any decoder.
    pub async fn read_all_envelopes(
        &self,
        from_position: GlobalPosition,
        max_count: Option<usize>,
    ) -> Result<Vec<Arc<StoredRecord>>, EventStoreError> {
        let records = self.inner.log.read_all(from_position, max_count).await?;

        self.inner.metrics.record_read("all", records.len());
        tracing::debug!(from_position = from_position, count = records.len(), "Read global log");

        Ok(records)
    }

    /// Version of the last event in the stream, or `NO_STREAM`.
    pub async fn get_stream_version(&self, stream_id: Uuid) -> Result<Version, EventStoreError> {
        Ok(self.inner.log.storage().stream_version(stream_id).await?)
    }

    pub async fn stream_exists(&self, stream_id: Uuid) -> Result<bool, EventStoreError> {
        Ok(self.get_stream_version(stream_id).await? >= 0)
    }

    /// Position the next committed event will receive.
    pub async fn head_position(&self) -> Result<GlobalPosition, EventStoreError> {
        Ok(self.inner.log.head_position().await?)
    }

    fn decode_all(&self, records: &[Arc<StoredRecord>]) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        records
            .iter()
            .map(|record| {
                let envelope = self.inner.serializer.deserialize(&record.data)?;
                Ok(RecordedEvent {
                    position: record.position,
                    envelope,
                })
            })
            .collect()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Deliver one stream's events from `from_version` on, then live.
    pub fn subscribe_to_stream<H>(
        &self,
        stream_id: Uuid,
        from_version: Version,
        handler: H,
    ) -> Result<Subscription, EventStoreError>
    where
        H: EventHandler<E>,
    {
        self.subscribe(SubscriptionScope::Stream(stream_id), from_version.max(0) as u64, handler, None)
    }

    /// Deliver every stream's events from `from_position` on, then live.
    pub fn subscribe_to_all<H>(
        &self,
        from_position: GlobalPosition,
        handler: H,
    ) -> Result<Subscription, EventStoreError>
    where
        H: EventHandler<E>,
    {
        self.subscribe(SubscriptionScope::All, from_position, handler, None)
    }

    /// Deliver every event tagged `event_type` from `from_position` on, then live.
    pub fn subscribe_to_event_type<H>(
        &self,
        event_type: impl Into<String>,
        from_position: GlobalPosition,
        handler: H,
    ) -> Result<Subscription, EventStoreError>
    where
        H: EventHandler<E>,
    {
        self.subscribe(SubscriptionScope::EventType(event_type.into()), from_position, handler, None)
    }

    /// Subscribe with an optional callback invoked if the subscription fails.
    pub fn subscribe<H>(
        &self,
        scope: SubscriptionScope,
        from: u64,
        handler: H,
        on_error: Option<ErrorCallback>,
    ) -> Result<Subscription, EventStoreError>
    where
        H: EventHandler<E>,
    {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(EventStoreError::ShuttingDown);
        }
        self.inner.subscriptions.subscribe(scope, from, handler, on_error)
    }

    /// Stop every subscription and refuse further appends.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::info!("Shutting down event store");
        self.inner.subscriptions.shutdown().await;
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
