use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use event_store_core::{RegistryError, TypeRegistry};

// ============================================================================
// Order Events - Demo domain carried through the event store
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Order Event - Union type for all order events
#[derive(Clone, Debug, PartialEq)]
pub enum OrderEvent {
    Created(OrderCreated),
    ItemsUpdated(OrderItemsUpdated),
    Confirmed(OrderConfirmed),
    Shipped(OrderShipped),
    Cancelled(OrderCancelled),
}

/// Order Created - Initial event in order lifecycle
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCreated {
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
}

/// Order Items Updated - Order contents modified
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderItemsUpdated {
    pub items: Vec<OrderItem>,
    pub reason: Option<String>,
}

/// Order Confirmed - Order accepted for fulfillment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderConfirmed {
    pub confirmed_at: DateTime<Utc>,
}

/// Order Shipped - Order dispatched to customer
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderShipped {
    pub tracking_number: String,
    pub carrier: String,
    pub shipped_at: DateTime<Utc>,
}

/// Order Cancelled - Order lifecycle ended
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OrderCancelled {
    pub reason: Option<String>,
    pub cancelled_by: Option<Uuid>,
}

impl OrderEvent {
    fn as_created(&self) -> Option<&OrderCreated> {
        match self {
            OrderEvent::Created(e) => Some(e),
            _ => None,
        }
    }

    fn as_items_updated(&self) -> Option<&OrderItemsUpdated> {
        match self {
            OrderEvent::ItemsUpdated(e) => Some(e),
            _ => None,
        }
    }

    fn as_confirmed(&self) -> Option<&OrderConfirmed> {
        match self {
            OrderEvent::Confirmed(e) => Some(e),
            _ => None,
        }
    }

    fn as_shipped(&self) -> Option<&OrderShipped> {
        match self {
            OrderEvent::Shipped(e) => Some(e),
            _ => None,
        }
    }

    fn as_cancelled(&self) -> Option<&OrderCancelled> {
        match self {
            OrderEvent::Cancelled(e) => Some(e),
            _ => None,
        }
    }
}

/// Registry binding every order event to its wire tag.
pub fn registry() -> Result<TypeRegistry<OrderEvent>, RegistryError> {
    let mut registry = TypeRegistry::new();
    registry
        .register("OrderCreated", OrderEvent::Created, OrderEvent::as_created)?
        .register("OrderItemsUpdated", OrderEvent::ItemsUpdated, OrderEvent::as_items_updated)?
        .register("OrderConfirmed", OrderEvent::Confirmed, OrderEvent::as_confirmed)?
        .register("OrderShipped", OrderEvent::Shipped, OrderEvent::as_shipped)?
        .register("OrderCancelled", OrderEvent::Cancelled, OrderEvent::as_cancelled)?;
    Ok(registry)
}
