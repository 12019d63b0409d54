// ============================================================================
// Event Store Core
// ============================================================================
//
// Append-only per-stream event log with optimistic concurrency, a single
// global order across streams, and catch-up/live subscriptions.
//
// - config          store configuration (TOML + environment)
// - event_sourcing  envelope, registry, serializer, store, subscriptions
// - metrics         prometheus metrics owned by each store
// - utils           retry with exponential backoff
//
// ============================================================================

pub mod config;
pub mod event_sourcing;
pub mod metrics;
pub mod utils;

pub use config::{load_config, ConfigError, EventStoreConfig, LoggingConfig, RetrySettings};
pub use event_sourcing::core::{
    DomainEvent, EventEnvelope, EventSerializer, GlobalPosition, NewEvent, RecordedEvent,
    RegistryError, SerializationError, TypeRegistry, Version, WireEnvelope, NO_STREAM,
};
pub use event_sourcing::store::{
    ConcurrencyError, EventStore, EventStoreError, InMemoryLog, LogStorage, StorageError,
    StoredRecord,
};
pub use event_sourcing::subscription::{
    ErrorCallback, EventHandler, Subscription, SubscriptionError, SubscriptionScope,
};
pub use metrics::EventStoreMetrics;
