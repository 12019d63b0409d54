// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// This module contains GENERIC persistence infrastructure for event sourcing.
// All components work with ANY event type registered in a TypeRegistry.
//
// ============================================================================

pub mod errors;
pub mod event_store;
pub mod global_log;
pub mod storage;

pub use errors::{ConcurrencyError, EventStoreError, StorageError};
pub use event_store::EventStore;
pub use global_log::{GlobalLog, PendingRecord};
pub use storage::{InMemoryLog, LogStorage, StoredRecord};
