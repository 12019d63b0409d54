// ============================================================================
// Event Sourcing Core - Envelope, Type Registry & Serializer
// ============================================================================
//
// GENERIC building blocks shared by the store and the subscriptions:
// - EventEnvelope / NewEvent / RecordedEvent: event plus metadata
// - TypeRegistry: tag <-> shape binding with encode/decode closures
// - EventSerializer: envelope <-> flat wire map
//
// No domain-specific code lives here.
//
// ============================================================================

pub mod errors;
pub mod event;
pub mod registry;
pub mod serializer;

// Re-export core types for convenience
pub use errors::{RegistryError, SerializationError};
pub use event::{DomainEvent, EventEnvelope, GlobalPosition, NewEvent, RecordedEvent, Version, NO_STREAM};
pub use registry::TypeRegistry;
pub use serializer::{EventSerializer, WireEnvelope};
