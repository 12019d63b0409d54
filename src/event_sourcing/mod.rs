// ============================================================================
// Event Sourcing Infrastructure
// ============================================================================
//
// Generic, reusable event store:
// - core/          envelope, type registry, serializer
// - store/         stream store, global log, storage port
// - subscription/  catch-up + live delivery to subscribers
//
// ============================================================================

pub mod core;
pub mod store;
pub mod subscription;

// Re-export the public surface of each layer
pub use self::core::{
    DomainEvent, EventEnvelope, EventSerializer, GlobalPosition, NewEvent, RecordedEvent,
    RegistryError, SerializationError, TypeRegistry, Version, WireEnvelope, NO_STREAM,
};
pub use self::store::{
    ConcurrencyError, EventStore, EventStoreError, GlobalLog, InMemoryLog, LogStorage,
    PendingRecord, StorageError, StoredRecord,
};
pub use self::subscription::{
    ErrorCallback, EventHandler, Notifier, Subscription, SubscriptionError, SubscriptionManager,
    SubscriptionScope,
};
