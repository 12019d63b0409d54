use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EventStoreConfig;
use crate::event_sourcing::core::serializer;
use crate::event_sourcing::core::{DomainEvent, EventSerializer, RecordedEvent, SerializationError};
use crate::event_sourcing::store::{EventStoreError, LogStorage, StorageError, StoredRecord};
use crate::metrics::EventStoreMetrics;
use crate::utils::{retry_on_transient, IsTransient, RetryConfig, RetryResult};
use super::errors::SubscriptionError;
use super::handler::{ErrorCallback, EventHandler};
use super::notifier::{LiveFeed, Notifier};

// ============================================================================
// Subscription Manager - Catch-up Then Live Delivery
// ============================================================================
//
// Each subscription owns one delivery task. The task:
// 1. Snapshots the head (stream version or global position)
// 2. Replays history from the requested cursor through that head
// 3. Attaches a live listener to the notifier
// 4. Replays whatever was committed between 1 and 3
// 5. Delivers live records as they are committed
//
// Every record is keyed by its cursor (version for a stream subscription,
// global position otherwise) and is delivered only if it is the next cursor,
// so the overlap between 4 and 5 never produces a duplicate. An event type
// subscription scans the global log and skips other types by their wire tag
// without decoding them.
//
// A handler call only starts while holding the subscription's gate and after
// re-checking the active flag; unsubscribe clears the flag and then takes the
// gate, so no handler call can begin after it returns.
//
// ============================================================================

/// Which records a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionScope {
    /// One stream, cursor is the stream version.
    Stream(Uuid),
    /// Every stream, cursor is the global position.
    All,
    /// Every event carrying this wire tag, cursor is the global position.
    EventType(String),
}

impl SubscriptionScope {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        match self {
            SubscriptionScope::Stream(id) => *id == record.stream_id,
            SubscriptionScope::All => true,
            SubscriptionScope::EventType(tag) => {
                serializer::event_type(&record.data).is_ok_and(|event_type| event_type == tag)
            }
        }
    }

    /// Cursor of `record` within this scope.
    pub fn cursor_of(&self, record: &StoredRecord) -> u64 {
        match self {
            SubscriptionScope::Stream(_) => record.version.max(0) as u64,
            SubscriptionScope::All | SubscriptionScope::EventType(_) => record.position,
        }
    }
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionScope::Stream(id) => write!(f, "stream:{}", id),
            SubscriptionScope::All => write!(f, "all"),
            SubscriptionScope::EventType(tag) => write!(f, "type:{}", tag),
        }
    }
}

struct SubscriptionState {
    id: Uuid,
    scope: SubscriptionScope,
    active: AtomicBool,
    cancel: watch::Sender<bool>,
    gate: Mutex<()>,
    /// Last acknowledged cursor, -1 before the first acknowledgement.
    last_acknowledged: AtomicI64,
    last_error: parking_lot::Mutex<Option<SubscriptionError>>,
    notifier: Arc<Notifier>,
}

/// Handle to a running subscription. Cheap to clone.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    pub fn scope(&self) -> &SubscriptionScope {
        &self.state.scope
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    /// Cursor of the last event the handler acknowledged.
    ///
    /// Resubscribe from `last_acknowledged() + 1` after a failure to resume.
    pub fn last_acknowledged(&self) -> Option<u64> {
        let cursor = self.state.last_acknowledged.load(Ordering::Acquire);
        (cursor >= 0).then_some(cursor as u64)
    }

    pub fn last_error(&self) -> Option<SubscriptionError> {
        self.state.last_error.lock().clone()
    }

    /// Stop delivery and wait for an in-flight handler call to finish.
    ///
    /// Idempotent. No handler call starts after this returns. Must not be
    /// awaited from inside this subscription's own handler; use `cancel`
    /// there instead.
    pub async fn unsubscribe(&self) {
        let was_active = self.state.active.swap(false, Ordering::AcqRel);
        self.state.cancel.send_replace(true);

        let _gate = self.state.gate.lock().await;
        self.state.notifier.detach(self.state.id);

        if was_active {
            info!(subscription_id = %self.state.id, scope = %self.state.scope, "Unsubscribed");
        }
    }

    /// Request a stop without waiting for an in-flight handler call.
    pub fn cancel(&self) {
        self.state.active.store(false, Ordering::Release);
        self.state.cancel.send_replace(true);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("scope", &self.state.scope)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Clone)]
struct DeliverySettings {
    buffer_size: usize,
    batch_size: usize,
    delivery_retry: RetryConfig,
    storage_retry: RetryConfig,
}

struct ManagerShared<E> {
    storage: Arc<dyn LogStorage>,
    serializer: EventSerializer<E>,
    notifier: Arc<Notifier>,
    metrics: Arc<EventStoreMetrics>,
    settings: DeliverySettings,
    subscriptions: DashMap<Uuid, Subscription>,
    closed: AtomicBool,
}

pub struct SubscriptionManager<E> {
    shared: Arc<ManagerShared<E>>,
}

impl<E: DomainEvent> SubscriptionManager<E> {
    pub fn new(
        storage: Arc<dyn LogStorage>,
        serializer: EventSerializer<E>,
        notifier: Arc<Notifier>,
        metrics: Arc<EventStoreMetrics>,
        config: &EventStoreConfig,
    ) -> Self {
        let settings = DeliverySettings {
            buffer_size: config.subscription_buffer_size.max(1),
            batch_size: config.catch_up_batch_size.max(1),
            delivery_retry: config.delivery_retry(),
            storage_retry: config.storage_retry(),
        };

        Self {
            shared: Arc::new(ManagerShared {
                storage,
                serializer,
                notifier,
                metrics,
                settings,
                subscriptions: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Start a subscription delivering from cursor `from` (inclusive).
    ///
    /// An event type scope must name a registered tag. Must be called from
    /// within a tokio runtime.
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
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(EventStoreError::ShuttingDown);
        }
        if let SubscriptionScope::EventType(tag) = &scope {
            if !self.shared.serializer.registry().contains_tag(tag) {
                return Err(SerializationError::UnknownEventType(tag.clone()).into());
            }
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let subscription = Subscription {
            state: Arc::new(SubscriptionState {
                id: Uuid::new_v4(),
                scope,
                active: AtomicBool::new(true),
                cancel,
                gate: Mutex::new(()),
                last_acknowledged: AtomicI64::new(-1),
                last_error: parking_lot::Mutex::new(None),
                notifier: self.shared.notifier.clone(),
            }),
        };

        self.shared.subscriptions.insert(subscription.id(), subscription.clone());
        self.shared.metrics.active_subscriptions.inc();

        info!(
            subscription_id = %subscription.id(),
            scope = %subscription.scope(),
            from = from,
            "Subscription started"
        );

        let delivery = Delivery {
            shared: self.shared.clone(),
            state: subscription.state.clone(),
            handler: Arc::new(handler),
            on_error,
            next: from,
        };
        tokio::spawn(delivery.run(cancel_rx));

        Ok(subscription)
    }

    pub fn get(&self, id: Uuid) -> Option<Subscription> {
        self.shared.subscriptions.get(&id).map(|entry| entry.value().clone())
    }

    /// Subscriptions whose delivery task is still running.
    pub fn active_count(&self) -> usize {
        self.shared.subscriptions.len()
    }

    /// Refuse new subscriptions and stop every running one.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);

        let running: Vec<Subscription> = self
            .shared
            .subscriptions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        info!(count = running.len(), "Stopping subscriptions");
        join_all(running.iter().map(|subscription| subscription.unsubscribe())).await;
    }
}

// ============================================================================
// Delivery Task
// ============================================================================

enum Stop {
    Cancelled,
    Failed(SubscriptionError),
}

impl From<SubscriptionError> for Stop {
    fn from(error: SubscriptionError) -> Self {
        Stop::Failed(error)
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("subscription cancelled")]
    Cancelled,

    #[error("{0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl IsTransient for AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Handler(_))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Delivery<E> {
    shared: Arc<ManagerShared<E>>,
    state: Arc<SubscriptionState>,
    handler: Arc<dyn EventHandler<E>>,
    on_error: Option<ErrorCallback>,
    /// Next cursor to deliver.
    next: u64,
}

impl<E: DomainEvent> Delivery<E> {
    async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        let id = self.state.id;

        match self.deliver_all(&mut cancel).await {
            Ok(()) | Err(Stop::Cancelled) => {
                debug!(subscription_id = %id, next_cursor = self.next, "Delivery task stopped");
            }
            Err(Stop::Failed(failure)) => self.fail(failure),
        }

        self.shared.notifier.detach(id);
        self.shared.subscriptions.remove(&id);
        self.shared.metrics.active_subscriptions.dec();
    }

    async fn deliver_all(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<(), Stop> {
        // Phase 1: history up to the head seen at subscribe time.
        if let Some(head) = self.head().await? {
            self.catch_up(Some(head), None).await?;
        }

        // Phase 2: attach, then close the gap opened while catching up.
        let mut feed = self
            .shared
            .notifier
            .attach(self.state.id, self.state.scope.clone(), self.shared.settings.buffer_size);
        if !self.is_active() {
            return Err(Stop::Cancelled);
        }
        self.catch_up(None, Some(feed.overflowed.as_ref())).await?;

        debug!(subscription_id = %self.state.id, next_cursor = self.next, "Caught up, delivering live");

        // Phase 3: live.
        self.live(&mut feed, cancel).await
    }

    async fn live(&mut self, feed: &mut LiveFeed, cancel: &mut watch::Receiver<bool>) -> Result<(), Stop> {
        loop {
            if *cancel.borrow() {
                return Err(Stop::Cancelled);
            }

            tokio::select! {
                _ = cancel.changed() => return Err(Stop::Cancelled),
                received = feed.receiver.recv() => match received {
                    Some(record) => self.deliver(&record).await?,
                    None if feed.overflowed.load(Ordering::Acquire) => return Err(self.overflow().into()),
                    None => return Err(Stop::Cancelled),
                },
            }
        }
    }

    /// Last cursor present at this moment, or None for an empty scope.
    async fn head(&self) -> Result<Option<u64>, SubscriptionError> {
        let storage = &self.shared.storage;
        let result = match &self.state.scope {
            &SubscriptionScope::Stream(stream_id) => {
                retry_on_transient(self.shared.settings.storage_retry.clone(), move |_| {
                    storage.stream_version(stream_id)
                })
                .await
                .into_result()
                .map(|version| (version >= 0).then_some(version as u64))
            }
            SubscriptionScope::All | SubscriptionScope::EventType(_) => {
                retry_on_transient(self.shared.settings.storage_retry.clone(), move |_| storage.next_position())
                    .await
                    .into_result()
                    .map(|next| next.checked_sub(1))
            }
        };

        result.map_err(|source| self.storage_failure(source))
    }

    /// Deliver stored records from `self.next` up to `upto` (or the end).
    ///
    /// With a live feed attached, stops as soon as that feed overflows.
    async fn catch_up(&mut self, upto: Option<u64>, overflowed: Option<&AtomicBool>) -> Result<(), Stop> {
        loop {
            if !self.is_active() {
                return Err(Stop::Cancelled);
            }
            if upto.is_some_and(|upto| self.next > upto) {
                return Ok(());
            }

            let batch = self.read_batch(self.next, upto).await?;
            let scanned = match batch.last() {
                Some(last) => self.state.scope.cursor_of(last),
                None => return Ok(()),
            };

            for record in &batch {
                if overflowed.is_some_and(|flag| flag.load(Ordering::Acquire)) {
                    return Err(self.overflow().into());
                }
                if self.state.scope.matches(record) {
                    self.deliver(record).await?;
                }
            }

            // Records filtered out by type are passed over, not redelivered.
            self.next = self.next.max(scanned + 1);
        }
    }

    async fn read_batch(&self, from: u64, upto: Option<u64>) -> Result<Vec<Arc<StoredRecord>>, SubscriptionError> {
        let storage = &self.shared.storage;
        let batch_size = self.shared.settings.batch_size;
        let retry = self.shared.settings.storage_retry.clone();

        let result = match &self.state.scope {
            &SubscriptionScope::Stream(stream_id) => {
                let to_version = upto.map(|upto| upto as i64);
                retry_on_transient(retry, move |_| {
                    storage.read_stream(stream_id, from as i64, to_version, Some(batch_size))
                })
                .await
            }
            SubscriptionScope::All | SubscriptionScope::EventType(_) => {
                retry_on_transient(retry, move |_| storage.read_all(from, Some(batch_size))).await
            }
        };

        let mut records = result.into_result().map_err(|source| self.storage_failure(source))?;
        if let Some(upto) = upto {
            records.retain(|record| self.state.scope.cursor_of(record) <= upto);
        }
        Ok(records)
    }

    async fn deliver(&mut self, record: &StoredRecord) -> Result<(), Stop> {
        let cursor = self.state.scope.cursor_of(record);
        if cursor < self.next {
            return Ok(());
        }
        if !self.is_active() {
            return Err(Stop::Cancelled);
        }

        let envelope = self
            .shared
            .serializer
            .deserialize(&record.data)
            .map_err(|source| SubscriptionError::Decode {
                subscription_id: self.state.id,
                cursor,
                source,
            })?;
        let event = RecordedEvent {
            position: record.position,
            envelope,
        };

        let state = &self.state;
        let handler = &self.handler;
        let event = &event;
        let mut attempts = 0;

        let outcome = retry_on_transient(self.shared.settings.delivery_retry.clone(), |attempt| {
            attempts = attempt;
            async move {
                let _gate = state.gate.lock().await;
                if !state.active.load(Ordering::Acquire) {
                    return Err(AttemptError::Cancelled);
                }
                // A panicking handler must still deactivate its subscription.
                match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                    Ok(result) => result.map_err(|e| AttemptError::Handler(format!("{:#}", e))),
                    Err(payload) => Err(AttemptError::Panicked(panic_message(payload.as_ref()))),
                }
            }
        })
        .await;

        match outcome {
            RetryResult::Success(()) => {
                self.next = cursor + 1;
                self.state.last_acknowledged.store(cursor as i64, Ordering::Release);
                self.shared.metrics.events_delivered.inc();
                debug!(
                    subscription_id = %self.state.id,
                    cursor = cursor,
                    position = record.position,
                    "Event delivered"
                );
                Ok(())
            }
            RetryResult::Failed(AttemptError::Cancelled)
            | RetryResult::PermanentFailure(AttemptError::Cancelled) => Err(Stop::Cancelled),
            RetryResult::Failed(failure) | RetryResult::PermanentFailure(failure) => {
                Err(Stop::Failed(SubscriptionError::Delivery {
                    subscription_id: self.state.id,
                    cursor,
                    attempts,
                    reason: failure.to_string(),
                }))
            }
        }
    }

    fn overflow(&self) -> SubscriptionError {
        SubscriptionError::BufferOverflow {
            subscription_id: self.state.id,
            last_delivered: u64::try_from(self.state.last_acknowledged.load(Ordering::Acquire)).ok(),
        }
    }

    fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }

    fn storage_failure(&self, source: StorageError) -> SubscriptionError {
        if source.is_transient() {
            warn!(subscription_id = %self.state.id, error = %source, "Storage still unavailable after retries");
        }
        SubscriptionError::Storage {
            subscription_id: self.state.id,
            source,
        }
    }

    fn fail(&self, failure: SubscriptionError) {
        self.state.active.store(false, Ordering::Release);
        *self.state.last_error.lock() = Some(failure.clone());
        self.shared.metrics.record_subscription_failure(failure.reason());

        error!(
            subscription_id = %self.state.id,
            scope = %self.state.scope,
            last_acknowledged = self.state.last_acknowledged.load(Ordering::Acquire),
            error = %failure,
            "Subscription deactivated"
        );

        if let Some(callback) = &self.on_error {
            callback(&failure);
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
