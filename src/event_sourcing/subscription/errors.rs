use uuid::Uuid;

use crate::event_sourcing::core::SerializationError;
use crate::event_sourcing::store::StorageError;

/// Why a subscription stopped delivering on its own.
///
/// Surfaced through `Subscription::last_error` and the error callback, never
/// returned to the appender.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("Subscription {subscription_id} gave up on cursor {cursor} after {attempts} attempts: {reason}")]
    Delivery {
        subscription_id: Uuid,
        cursor: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Subscription {subscription_id} fell behind and its buffer overflowed (last delivered: {last_delivered:?})")]
    BufferOverflow {
        subscription_id: Uuid,
        last_delivered: Option<u64>,
    },

    #[error("Subscription {subscription_id} cannot decode event at cursor {cursor}: {source}")]
    Decode {
        subscription_id: Uuid,
        cursor: u64,
        source: SerializationError,
    },

    #[error("Subscription {subscription_id} lost its storage connection: {source}")]
    Storage {
        subscription_id: Uuid,
        source: StorageError,
    },
}

impl SubscriptionError {
    pub fn subscription_id(&self) -> Uuid {
        match self {
            SubscriptionError::Delivery { subscription_id, .. }
            | SubscriptionError::BufferOverflow { subscription_id, .. }
            | SubscriptionError::Decode { subscription_id, .. }
            | SubscriptionError::Storage { subscription_id, .. } => *subscription_id,
        }
    }

    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            SubscriptionError::Delivery { .. } => "delivery",
            SubscriptionError::BufferOverflow { .. } => "overflow",
            SubscriptionError::Decode { .. } => "decode",
            SubscriptionError::Storage { .. } => "storage",
        }
    }
}
