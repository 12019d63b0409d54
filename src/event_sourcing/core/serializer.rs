use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::SerializationError;
use super::event::{DomainEvent, EventEnvelope, Version};
use super::registry::TypeRegistry;

// ============================================================================
// Event Serializer - Domain Event <-> Flat Wire Envelope
// ============================================================================
//
// The wire envelope is a flat map of string keys to string values:
//
//   aggregateId, eventId, eventType, version, timestamp   (required)
//   correlationId, causationId                            (optional)
//   <payload fields>                                      (one per field)
//
// Payload fields come from the serde representation of the registered shape.
// Strings are stored raw unless the raw text would itself parse as JSON, in
// which case they are stored JSON-quoted. Everything else (numbers, bools,
// null, arrays, nested objects) is stored as JSON text. Decoding parses each
// field as JSON and falls back to the raw string, so the mapping is lossless.
//
// ============================================================================

/// Flat wire representation of one event.
pub type WireEnvelope = BTreeMap<String, String>;

pub const AGGREGATE_ID_FIELD: &str = "aggregateId";
pub const EVENT_ID_FIELD: &str = "eventId";
pub const EVENT_TYPE_FIELD: &str = "eventType";
pub const VERSION_FIELD: &str = "version";
pub const TIMESTAMP_FIELD: &str = "timestamp";
pub const CORRELATION_ID_FIELD: &str = "correlationId";
pub const CAUSATION_ID_FIELD: &str = "causationId";

pub const ENVELOPE_FIELDS: [&str; 7] = [
    AGGREGATE_ID_FIELD,
    EVENT_ID_FIELD,
    EVENT_TYPE_FIELD,
    VERSION_FIELD,
    TIMESTAMP_FIELD,
    CORRELATION_ID_FIELD,
    CAUSATION_ID_FIELD,
];

pub struct EventSerializer<E> {
    registry: Arc<TypeRegistry<E>>,
}

impl<E> Clone for EventSerializer<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: DomainEvent> EventSerializer<E> {
    pub fn new(registry: Arc<TypeRegistry<E>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TypeRegistry<E> {
        &self.registry
    }

    /// Wire tag for the shape carried by `event`.
    pub fn event_type_of(&self, event: &E) -> Result<&str, SerializationError> {
        self.registry
            .tag_of(event)
            .ok_or_else(|| SerializationError::UnregisteredShape(format!("{:?}", event)))
    }

    /// Flatten an envelope into its wire form.
    ///
    /// The `eventType` written is always the registered tag of the payload.
    pub fn serialize(&self, envelope: &EventEnvelope<E>) -> Result<WireEnvelope, SerializationError> {
        let (tag, value) = self.registry.encode(&envelope.payload)?;

        let fields = match value {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => {
                return Err(SerializationError::InvalidPayload {
                    event_type: tag.to_string(),
                    reason: format!("payload must serialize to an object, got {}", json_kind(&other)),
                })
            }
        };

        let mut data = WireEnvelope::new();
        data.insert(AGGREGATE_ID_FIELD.to_string(), envelope.aggregate_id.to_string());
        data.insert(EVENT_ID_FIELD.to_string(), envelope.event_id.to_string());
        data.insert(EVENT_TYPE_FIELD.to_string(), tag.to_string());
        data.insert(VERSION_FIELD.to_string(), envelope.version.to_string());
        data.insert(TIMESTAMP_FIELD.to_string(), format_timestamp(&envelope.timestamp));
        if let Some(correlation_id) = envelope.correlation_id {
            data.insert(CORRELATION_ID_FIELD.to_string(), correlation_id.to_string());
        }
        if let Some(causation_id) = envelope.causation_id {
            data.insert(CAUSATION_ID_FIELD.to_string(), causation_id.to_string());
        }

        for (key, value) in fields {
            if ENVELOPE_FIELDS.contains(&key.as_str()) {
                return Err(SerializationError::ReservedField(key));
            }
            data.insert(key, encode_field(value));
        }

        Ok(data)
    }

    /// Rebuild an envelope from its wire form using the registered decoder.
    pub fn deserialize(&self, data: &WireEnvelope) -> Result<EventEnvelope<E>, SerializationError> {
        let event_type = event_type(data)?;
        if !self.registry.contains_tag(event_type) {
            return Err(SerializationError::UnknownEventType(event_type.to_string()));
        }

        let aggregate_id = aggregate_id(data)?;
        let event_id = event_id(data)?;
        let version = version(data)?;
        let timestamp = timestamp(data)?;
        let correlation_id = optional_uuid(data, CORRELATION_ID_FIELD)?;
        let causation_id = optional_uuid(data, CAUSATION_ID_FIELD)?;

        let fields: Map<String, Value> = data
            .iter()
            .filter(|(key, _)| !ENVELOPE_FIELDS.contains(&key.as_str()))
            .map(|(key, raw)| (key.clone(), decode_field(raw)))
            .collect();

        let payload = if fields.is_empty() {
            // Unit-like shapes serialize to null rather than an empty object.
            self.registry
                .decode(event_type, Value::Object(Map::new()))
                .or_else(|_| self.registry.decode(event_type, Value::Null))?
        } else {
            self.registry.decode(event_type, Value::Object(fields))?
        };

        Ok(EventEnvelope {
            event_id,
            aggregate_id,
            version,
            event_type: event_type.to_string(),
            payload,
            causation_id,
            correlation_id,
            timestamp,
        })
    }
}

// ============================================================================
// Lightweight Accessors - read single fields without decoding the payload
// ============================================================================

pub fn event_type(data: &WireEnvelope) -> Result<&str, SerializationError> {
    required(data, EVENT_TYPE_FIELD)
}

pub fn aggregate_id(data: &WireEnvelope) -> Result<Uuid, SerializationError> {
    parse_field(data, AGGREGATE_ID_FIELD)
}

pub fn event_id(data: &WireEnvelope) -> Result<Uuid, SerializationError> {
    parse_field(data, EVENT_ID_FIELD)
}

pub fn version(data: &WireEnvelope) -> Result<Version, SerializationError> {
    let version: Version = parse_field(data, VERSION_FIELD)?;
    if version < 0 {
        return Err(malformed(VERSION_FIELD, &version.to_string(), "version must be non-negative"));
    }
    Ok(version)
}

pub fn timestamp(data: &WireEnvelope) -> Result<DateTime<Utc>, SerializationError> {
    let raw = required(data, TIMESTAMP_FIELD)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| malformed(TIMESTAMP_FIELD, raw, &e.to_string()))
}

/// ISO-8601 rendering used on the wire.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

// ============================================================================
// Field Helpers
// ============================================================================

fn required<'a>(data: &'a WireEnvelope, field: &str) -> Result<&'a str, SerializationError> {
    data.get(field)
        .map(String::as_str)
        .ok_or_else(|| SerializationError::MissingRequiredField(field.to_string()))
}

fn parse_field<T>(data: &WireEnvelope, field: &str) -> Result<T, SerializationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = required(data, field)?;
    raw.parse::<T>().map_err(|e| malformed(field, raw, &e.to_string()))
}

fn optional_uuid(data: &WireEnvelope, field: &str) -> Result<Option<Uuid>, SerializationError> {
    match data.get(field) {
        None => Ok(None),
        Some(raw) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|e| malformed(field, raw, &e.to_string())),
    }
}

fn malformed(field: &str, value: &str, reason: &str) -> SerializationError {
    SerializationError::MalformedField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn encode_field(value: Value) -> String {
    match value {
        Value::String(raw) => {
            if serde_json::from_str::<Value>(&raw).is_ok() {
                Value::String(raw).to_string()
            } else {
                raw
            }
        }
        other => other.to_string(),
    }
}

fn decode_field(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct LineItem {
        sku: String,
        quantity: i32,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct OrderPlaced {
        customer: String,
        note: String,
        total_cents: i64,
        express: bool,
        coupon: Option<String>,
        items: Vec<LineItem>,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct OrderArchived;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Clashing {
        version: String,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum OrderEvent {
        Placed(OrderPlaced),
        Archived(OrderArchived),
        Clashing(Clashing),
    }

    fn serializer() -> EventSerializer<OrderEvent> {
        let mut registry = TypeRegistry::new();
        registry
            .register("OrderPlaced", OrderEvent::Placed, |e| match e {
                OrderEvent::Placed(p) => Some(p),
                _ => None,
            })
            .unwrap()
            .register("OrderArchived", OrderEvent::Archived, |e| match e {
                OrderEvent::Archived(a) => Some(a),
                _ => None,
            })
            .unwrap()
            .register("Clashing", OrderEvent::Clashing, |e| match e {
                OrderEvent::Clashing(c) => Some(c),
                _ => None,
            })
            .unwrap();
        EventSerializer::new(Arc::new(registry))
    }

    fn placed() -> OrderEvent {
        OrderEvent::Placed(OrderPlaced {
            customer: "ada".to_string(),
            note: "42".to_string(),
            total_cents: 1999,
            express: true,
            coupon: None,
            items: vec![
                LineItem { sku: "A-1".to_string(), quantity: 2 },
                LineItem { sku: "B-7".to_string(), quantity: 1 },
            ],
        })
    }

    fn envelope(payload: OrderEvent) -> EventEnvelope<OrderEvent> {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            aggregate_id: Uuid::new_v4(),
            version: 4,
            event_type: String::new(),
            payload,
            causation_id: None,
            correlation_id: Some(Uuid::new_v4()),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_serialize_writes_flat_envelope() {
        let serializer = serializer();
        let envelope = envelope(placed());

        let data = serializer.serialize(&envelope).unwrap();

        assert_eq!(data[AGGREGATE_ID_FIELD], envelope.aggregate_id.to_string());
        assert_eq!(data[EVENT_ID_FIELD], envelope.event_id.to_string());
        assert_eq!(data[EVENT_TYPE_FIELD], "OrderPlaced");
        assert_eq!(data[VERSION_FIELD], "4");
        assert!(data.contains_key(CORRELATION_ID_FIELD));
        assert!(!data.contains_key(CAUSATION_ID_FIELD));

        assert_eq!(data["customer"], "ada");
        assert_eq!(data["note"], "\"42\"");
        assert_eq!(data["total_cents"], "1999");
        assert_eq!(data["express"], "true");
        assert_eq!(data["coupon"], "null");
        assert!(data["items"].starts_with('['));
    }

    #[test]
    fn test_round_trip_is_stable() {
        let serializer = serializer();

        for payload in [placed(), OrderEvent::Archived(OrderArchived)] {
            let first = serializer.serialize(&envelope(payload)).unwrap();
            let decoded = serializer.deserialize(&first).unwrap();
            let second = serializer.serialize(&decoded).unwrap();

            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_deserialize_restores_metadata_and_payload() {
        let serializer = serializer();
        let original = envelope(placed());

        let decoded = serializer.deserialize(&serializer.serialize(&original).unwrap()).unwrap();

        assert_eq!(decoded.payload, original.payload);
        assert_eq!(decoded.event_id, original.event_id);
        assert_eq!(decoded.aggregate_id, original.aggregate_id);
        assert_eq!(decoded.version, original.version);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.correlation_id, original.correlation_id);
        assert_eq!(decoded.event_type, "OrderPlaced");
    }

    #[test]
    fn test_string_fields_that_look_like_json_survive() {
        let serializer = serializer();
        let mut env = envelope(placed());
        if let OrderEvent::Placed(p) = &mut env.payload {
            p.customer = "{\"not\":\"an object\"}".to_string();
            p.coupon = Some("null".to_string());
        }

        let decoded = serializer.deserialize(&serializer.serialize(&env).unwrap()).unwrap();
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn test_unknown_event_type() {
        let serializer = serializer();
        let mut data = serializer.serialize(&envelope(placed())).unwrap();
        data.insert(EVENT_TYPE_FIELD.to_string(), "OrderTeleported".to_string());

        let result = serializer.deserialize(&data);
        assert_eq!(result, Err(SerializationError::UnknownEventType("OrderTeleported".to_string())));
    }

    #[test]
    fn test_missing_required_field() {
        let serializer = serializer();
        let mut data = serializer.serialize(&envelope(placed())).unwrap();
        data.remove(TIMESTAMP_FIELD);

        let result = serializer.deserialize(&data);
        assert_eq!(result, Err(SerializationError::MissingRequiredField(TIMESTAMP_FIELD.to_string())));
    }

    #[test]
    fn test_malformed_fields() {
        let serializer = serializer();
        let data = serializer.serialize(&envelope(placed())).unwrap();

        for (field, bad) in [
            (AGGREGATE_ID_FIELD, "order-123"),
            (VERSION_FIELD, "four"),
            (VERSION_FIELD, "-2"),
            (TIMESTAMP_FIELD, "yesterday"),
            (CORRELATION_ID_FIELD, "xyz"),
        ] {
            let mut broken = data.clone();
            broken.insert(field.to_string(), bad.to_string());

            match serializer.deserialize(&broken) {
                Err(SerializationError::MalformedField { field: f, .. }) => assert_eq!(f, field),
                other => panic!("Expected MalformedField for {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn test_payload_field_colliding_with_envelope_is_rejected() {
        let serializer = serializer();
        let env = envelope(OrderEvent::Clashing(Clashing { version: "x".to_string() }));

        let result = serializer.serialize(&env);
        assert_eq!(result, Err(SerializationError::ReservedField(VERSION_FIELD.to_string())));
    }

    #[test]
    fn test_accessors_skip_payload_decoding() {
        let serializer = serializer();
        let env = envelope(placed());
        let mut data = serializer.serialize(&env).unwrap();
        // A payload the decoder would reject does not affect the accessors.
        data.insert("items".to_string(), "garbage".to_string());

        assert_eq!(aggregate_id(&data).unwrap(), env.aggregate_id);
        assert_eq!(event_id(&data).unwrap(), env.event_id);
        assert_eq!(version(&data).unwrap(), 4);
        assert_eq!(event_type(&data).unwrap(), "OrderPlaced");
        assert!(matches!(
            serializer.deserialize(&data),
            Err(SerializationError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_timestamp_format_is_utc_rfc3339() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:15:30.125Z").unwrap().with_timezone(&Utc);
        assert_eq!(format_timestamp(&ts), "2024-03-01T10:15:30.125Z");
    }
}
