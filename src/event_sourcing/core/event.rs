use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

// ============================================================================
// Event Envelope - Event Metadata Around a Domain Event
// ============================================================================
//
// Wraps a domain event with the metadata the store persists next to it.
// This is GENERIC and works with ANY event type registered in a TypeRegistry.
//
// Versions are 0-based per stream; a stream with no events sits at NO_STREAM.
//
// ============================================================================

/// Per-stream sequence number of a persisted event.
pub type Version = i64;

/// Position of a persisted event in the cross-stream log.
pub type GlobalPosition = u64;

/// Version reported for a stream that has never been appended to.
pub const NO_STREAM: Version = -1;

/// Marker for in-memory domain event types the store can carry.
///
/// Usually implemented by an enum with one variant per event shape; the
/// variants are bound to wire tags in a [`TypeRegistry`](super::TypeRegistry).
pub trait DomainEvent: Clone + Debug + Send + Sync + 'static {}

impl<T> DomainEvent for T where T: Clone + Debug + Send + Sync + 'static {}

/// A persisted event with all of its metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct EventEnvelope<E> {
    // Event Identity
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub version: Version,

    // Registered wire tag of the payload
    pub event_type: String,

    // Event Payload
    pub payload: E,

    // Causation & Correlation (for distributed tracing)
    pub causation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,

    // Timing
    pub timestamp: DateTime<Utc>,
}

/// An event handed to the store for appending.
///
/// Version and event type are assigned by the store at append time.
#[derive(Clone, Debug)]
pub struct NewEvent<E> {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub payload: E,
    pub causation_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl<E> NewEvent<E> {
    pub fn new(aggregate_id: Uuid, payload: E) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id,
            payload,
            causation_id: None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Stamp the event with its stream version and wire tag.
    pub fn into_envelope(self, version: Version, event_type: impl Into<String>) -> EventEnvelope<E> {
        EventEnvelope {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            version,
            event_type: event_type.into(),
            payload: self.payload,
            causation_id: self.causation_id,
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
        }
    }
}

/// An envelope together with the global position it was committed at.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent<E> {
    pub position: GlobalPosition,
    pub envelope: EventEnvelope<E>,
}

impl<E> RecordedEvent<E> {
    pub fn version(&self) -> Version {
        self.envelope.version
    }

    pub fn stream_id(&self) -> Uuid {
        self.envelope.aggregate_id
    }

    pub fn event_id(&self) -> Uuid {
        self.envelope.event_id
    }

    pub fn payload(&self) -> &E {
        &self.envelope.payload
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestEvent {
        data: String,
    }

    #[test]
    fn test_new_event_defaults() {
        let aggregate_id = Uuid::new_v4();
        let event = NewEvent::new(aggregate_id, TestEvent { data: "test".to_string() });

        assert_eq!(event.aggregate_id, aggregate_id);
        assert!(event.correlation_id.is_none());
        assert!(event.causation_id.is_none());
    }

    #[test]
    fn test_into_envelope_keeps_metadata() {
        let aggregate_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let causation_id = Uuid::new_v4();

        let event = NewEvent::new(aggregate_id, TestEvent { data: "test".to_string() })
            .with_correlation(correlation_id)
            .with_causation(causation_id);
        let event_id = event.event_id;

        let envelope = event.into_envelope(3, "TestEvent");

        assert_eq!(envelope.event_id, event_id);
        assert_eq!(envelope.aggregate_id, aggregate_id);
        assert_eq!(envelope.version, 3);
        assert_eq!(envelope.event_type, "TestEvent");
        assert_eq!(envelope.correlation_id, Some(correlation_id));
        assert_eq!(envelope.causation_id, Some(causation_id));
        assert_eq!(envelope.payload.data, "test");
    }

    #[test]
    fn test_recorded_event_accessors() {
        let aggregate_id = Uuid::new_v4();
        let envelope = NewEvent::new(aggregate_id, TestEvent { data: "x".to_string() })
            .into_envelope(0, "TestEvent");
        let recorded = RecordedEvent { position: 7, envelope };

        assert_eq!(recorded.version(), 0);
        assert_eq!(recorded.stream_id(), aggregate_id);
        assert_eq!(recorded.payload().data, "x");
        assert_eq!(recorded.position, 7);
    }
}
