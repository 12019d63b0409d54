use uuid::Uuid;

use crate::event_sourcing::core::{SerializationError, Version};
use crate::utils::IsTransient;

// ============================================================================
// Store Errors
// ============================================================================

/// Expected-version mismatch on append.
///
/// Recoverable: re-read the stream version and retry the append.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Concurrency conflict on stream {stream_id}: expected version {expected}, actual {actual}")]
pub struct ConcurrencyError {
    pub stream_id: Uuid,
    pub expected: Version,
    pub actual: Version,
}

/// Failures reported by a [`LogStorage`](super::LogStorage) backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Stream {stream_id} is at version {actual}, append rejected")]
    Conflict { stream_id: Uuid, actual: Version },

    #[error("Append expected next global position {expected}, storage is at {actual}")]
    PositionMismatch { expected: u64, actual: u64 },

    #[error("Invalid append batch: {0}")]
    InvalidBatch(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Event for aggregate {aggregate_id} cannot be appended to stream {stream_id}")]
    AggregateMismatch { stream_id: Uuid, aggregate_id: Uuid },

    #[error("Event store is shutting down")]
    ShuttingDown,
}

impl EventStoreError {
    pub fn as_concurrency(&self) -> Option<&ConcurrencyError> {
        match self {
            EventStoreError::Concurrency(conflict) => Some(conflict),
            _ => None,
        }
    }
}

impl IsTransient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::PositionMismatch { .. })
    }
}

impl IsTransient for EventStoreError {
    fn is_transient(&self) -> bool {
        match self {
            EventStoreError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
