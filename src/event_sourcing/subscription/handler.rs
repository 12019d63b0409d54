use async_trait::async_trait;
use std::sync::Arc;

use crate::event_sourcing::core::{DomainEvent, RecordedEvent};
use super::errors::SubscriptionError;

/// Consumer side of a subscription.
///
/// Delivery is at-least-once: the same event may reach `handle` more than
/// once (retries, resubscribing from an older cursor), so implementations
/// should be idempotent, typically by remembering processed event ids.
///
/// Returning `Err` makes the subscription retry the same event with backoff;
/// once the retry budget is spent the subscription deactivates itself.
#[async_trait]
pub trait EventHandler<E>: Send + Sync + 'static {
    async fn handle(&self, event: &RecordedEvent<E>) -> anyhow::Result<()>;
}

#[async_trait]
impl<E, F> EventHandler<E> for F
where
    E: DomainEvent,
    F: Fn(&RecordedEvent<E>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &RecordedEvent<E>) -> anyhow::Result<()> {
        (self)(event)
    }
}

/// Called once when a subscription deactivates itself on failure.
pub type ErrorCallback = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;
