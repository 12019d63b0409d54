// ============================================================================
// Subscriptions - Catch-up and Live Delivery to Consumers
// ============================================================================
//
// The notifier is fed by the global log on every commit; the manager owns one
// delivery task per subscription that replays history from storage and then
// switches to the notifier's live feed.
//
// ============================================================================

pub mod errors;
pub mod handler;
pub mod manager;
pub mod notifier;

pub use errors::SubscriptionError;
pub use handler::{ErrorCallback, EventHandler};
pub use manager::{Subscription, SubscriptionManager, SubscriptionScope};
pub use notifier::Notifier;
