use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use event_store_core::utils::{retry_with_backoff, RetryConfig};
use event_store_core::{
    load_config, EventHandler, EventStore, EventStoreError, InMemoryLog, LoggingConfig, NewEvent,
    RecordedEvent, NO_STREAM,
};

mod orders;

use orders::{
    OrderCancelled, OrderConfirmed, OrderCreated, OrderEvent, OrderItem, OrderItemsUpdated, OrderShipped,
};

// ============================================================================
// Order Projection - counts events per order, skipping redeliveries
// ============================================================================

#[derive(Clone, Default)]
struct OrderProjection {
    seen: Arc<Mutex<HashSet<Uuid>>>,
    events_per_order: Arc<Mutex<HashMap<Uuid, usize>>>,
}

#[async_trait]
impl EventHandler<OrderEvent> for OrderProjection {
    async fn handle(&self, event: &RecordedEvent<OrderEvent>) -> anyhow::Result<()> {
        if !self.seen.lock().insert(event.event_id()) {
            tracing::debug!(event_id = %event.event_id(), "Duplicate delivery ignored");
            return Ok(());
        }

        *self.events_per_order.lock().entry(event.stream_id()).or_default() += 1;

        tracing::info!(
            position = event.position,
            order_id = %event.stream_id(),
            version = event.version(),
            event_type = %event.envelope.event_type,
            "📬 Projection received event"
        );
        Ok(())
    }
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info,event_store_core=debug"));

    if logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config path: first argument, else EVENT_STORE_CONFIG, else defaults
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EVENT_STORE_CONFIG").ok());
    let config = load_config(config_path.as_deref())?;

    init_tracing(&config.logging);

    tracing::info!("🚀 Starting event store demo");

    // === 1. Build the store over an in-memory log ===
    let registry = Arc::new(orders::registry()?);
    tracing::info!(event_types = registry.len(), "Registered order event types");

    let store = EventStore::new(Arc::new(InMemoryLog::new()), registry, &config);

    // === 2. Subscribe a projection to every stream ===
    let projection = OrderProjection::default();
    let subscription = store.subscribe_to_all(0, projection.clone())?;

    // Cancellations only, dispatched by event type
    store.subscribe_to_event_type("OrderCancelled", 0, |event: &RecordedEvent<OrderEvent>| -> anyhow::Result<()> {
        tracing::warn!(
            order_id = %event.stream_id(),
            position = event.position,
            "🚫 Cancellation observed"
        );
        Ok(())
    })?;

    // === 3. Order lifecycle ===
    let order_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4();

    let created = NewEvent::new(
        order_id,
        OrderEvent::Created(OrderCreated {
            customer_id: Uuid::new_v4(),
            items: vec![
                OrderItem { product_id: Uuid::new_v4(), quantity: 2 },
                OrderItem { product_id: Uuid::new_v4(), quantity: 1 },
            ],
        }),
    )
    .with_correlation(correlation_id);

    let version = store.append_to_stream(order_id, NO_STREAM, created).await?;
    tracing::info!(order_id = %order_id, version = version, "✅ Order created");

    let version = store
        .append_batch_to_stream(
            order_id,
            version,
            vec![
                NewEvent::new(
                    order_id,
                    OrderEvent::ItemsUpdated(OrderItemsUpdated {
                        items: vec![OrderItem { product_id: Uuid::new_v4(), quantity: 5 }],
                        reason: Some("Customer changed quantity".to_string()),
                    }),
                )
                .with_correlation(correlation_id),
                NewEvent::new(order_id, OrderEvent::Confirmed(OrderConfirmed { confirmed_at: Utc::now() }))
                    .with_correlation(correlation_id),
            ],
        )
        .await?;
    tracing::info!(order_id = %order_id, version = version, "✅ Order updated and confirmed");

    // === 4. Two writers race on the same expected version ===
    let shipped = NewEvent::new(
        order_id,
        OrderEvent::Shipped(OrderShipped {
            tracking_number: "TRK-1042".to_string(),
            carrier: "ACME Freight".to_string(),
            shipped_at: Utc::now(),
        }),
    );
    let late_update = NewEvent::new(
        order_id,
        OrderEvent::ItemsUpdated(OrderItemsUpdated {
            items: vec![OrderItem { product_id: Uuid::new_v4(), quantity: 1 }],
            reason: Some("Gift wrap added".to_string()),
        }),
    );

    let (first, second) = tokio::join!(
        store.append_to_stream(order_id, version, shipped.clone()),
        store.append_to_stream(order_id, version, late_update.clone()),
    );

    let loser = match (first, second) {
        (Ok(won), Err(EventStoreError::Concurrency(conflict))) => {
            tracing::warn!(new_version = won, conflict = %conflict, "⚔️ Shipment won, update must retry");
            late_update
        }
        (Err(EventStoreError::Concurrency(conflict)), Ok(won)) => {
            tracing::warn!(new_version = won, conflict = %conflict, "⚔️ Update won, shipment must retry");
            shipped
        }
        (first, second) => anyhow::bail!("Unexpected race outcome: {:?} / {:?}", first, second),
    };

    // The loser re-reads the stream version and appends again
    let version = retry_with_backoff(RetryConfig::default(), |attempt| {
        let store = store.clone();
        let event = loser.clone();
        async move {
            let current = store.get_stream_version(order_id).await?;
            tracing::info!(attempt = attempt, current_version = current, "Retrying append");
            store.append_to_stream(order_id, current, event).await
        }
    })
    .await
    .into_result()?;
    tracing::info!(order_id = %order_id, version = version, "✅ Retried append succeeded");

    // === 5. A second order is abandoned ===
    let abandoned_id = Uuid::new_v4();
    let customer_id = Uuid::new_v4();
    let version = store
        .append_batch_to_stream(
            abandoned_id,
            NO_STREAM,
            vec![
                NewEvent::new(
                    abandoned_id,
                    OrderEvent::Created(OrderCreated {
                        customer_id,
                        items: vec![OrderItem { product_id: Uuid::new_v4(), quantity: 3 }],
                    }),
                ),
                NewEvent::new(
                    abandoned_id,
                    OrderEvent::Cancelled(OrderCancelled {
                        reason: Some("Payment declined".to_string()),
                        cancelled_by: Some(customer_id),
                    }),
                ),
            ],
        )
        .await?;
    tracing::info!(order_id = %abandoned_id, version = version, "🛑 Order cancelled");

    // === 6. Wait for the projection to catch up ===
    let last_position = store.head_position().await?.saturating_sub(1);
    for _ in 0..100 {
        if subscription.last_acknowledged() == Some(last_position) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let history = store.read_from_stream(order_id, 0, None).await?;
    for event in &history {
        tracing::info!(
            version = event.version(),
            position = event.position,
            event_type = %event.envelope.event_type,
            "📜 Stream history"
        );
    }

    let projected = projection.events_per_order.lock().get(&order_id).copied().unwrap_or(0);
    tracing::info!(
        stored = history.len(),
        projected = projected,
        subscription_active = subscription.is_active(),
        "📊 Projection status"
    );

    // === 7. Metrics and shutdown ===
    println!("{}", store.metrics().gather_text()?);

    store.shutdown().await;
    tracing::info!("🎉 Demo complete!");

    Ok(())
}
