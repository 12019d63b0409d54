// ============================================================================
// Serialization & Registry Errors
// ============================================================================
//
// Serialization errors are terminal for the single event they concern and
// never leave the store in a partially written state.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SerializationError {
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Event shape is not registered: {0}")]
    UnregisteredShape(String),

    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    #[error("Malformed field {field}={value:?}: {reason}")]
    MalformedField {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Payload field {0} collides with an envelope field")]
    ReservedField(String),

    #[error("Invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("Event type {tag} is already bound to {registered}, cannot bind it to {attempted}")]
    TypeConflict {
        tag: String,
        registered: &'static str,
        attempted: &'static str,
    },

    #[error("{shape} is already registered as {registered_tag}, cannot register it as {attempted_tag}")]
    ShapeConflict {
        shape: &'static str,
        registered_tag: String,
        attempted_tag: String,
    },
}
