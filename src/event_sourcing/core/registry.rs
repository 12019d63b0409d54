use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::any::{type_name, TypeId};
use std::collections::HashMap;

use super::errors::{RegistryError, SerializationError};
use super::event::DomainEvent;

// ============================================================================
// Event Type Registry - Bidirectional Tag <-> Shape Mapping
// ============================================================================
//
// Binds each concrete event shape (a serde type carried by one variant of the
// domain event enum) to a string tag used on the wire. Every binding holds a
// match closure (is this my variant?), an encode closure (variant -> JSON)
// and a decode closure (JSON -> variant). Tag lookups only run the match
// closure; the payload is serialized once, by `encode`.
//
// The registry is a plain value: build it once, wrap it in an Arc and hand it
// to every serializer/store that needs it.
//
// ============================================================================

type MatchFn<E> = dyn Fn(&E) -> bool + Send + Sync;
type EncodeFn<E> = dyn Fn(&E) -> Option<Result<Value, serde_json::Error>> + Send + Sync;
type DecodeFn<E> = dyn Fn(Value) -> Result<E, serde_json::Error> + Send + Sync;

struct EventCodec<E> {
    tag: String,
    shape: TypeId,
    shape_name: &'static str,
    carries: Box<MatchFn<E>>,
    encode: Box<EncodeFn<E>>,
    decode: Box<DecodeFn<E>>,
}

pub struct TypeRegistry<E> {
    codecs: Vec<EventCodec<E>>,
    by_tag: HashMap<String, usize>,
    by_shape: HashMap<TypeId, usize>,
}

impl<E: DomainEvent> Default for TypeRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: DomainEvent> TypeRegistry<E> {
    pub fn new() -> Self {
        Self {
            codecs: Vec::new(),
            by_tag: HashMap::new(),
            by_shape: HashMap::new(),
        }
    }

    /// Bind `tag` to the event shape `T`.
    ///
    /// `wrap` lifts a decoded `T` into the domain event type and `unwrap`
    /// borrows the `T` back out of it (returning `None` for other variants).
    /// Registering the same tag/shape pair twice is a no-op; binding a tag
    /// or a shape a second time to something else is rejected.
    pub fn register<T>(
        &mut self,
        tag: impl Into<String>,
        wrap: fn(T) -> E,
        unwrap: fn(&E) -> Option<&T>,
    ) -> Result<&mut Self, RegistryError>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let tag = tag.into();
        let shape = TypeId::of::<T>();
        let shape_name = type_name::<T>();

        if let Some(&index) = self.by_tag.get(&tag) {
            let existing = &self.codecs[index];
            if existing.shape == shape {
                return Ok(self);
            }
            return Err(RegistryError::TypeConflict {
                tag,
                registered: existing.shape_name,
                attempted: shape_name,
            });
        }

        if let Some(&index) = self.by_shape.get(&shape) {
            return Err(RegistryError::ShapeConflict {
                shape: shape_name,
                registered_tag: self.codecs[index].tag.clone(),
                attempted_tag: tag,
            });
        }

        let codec = EventCodec {
            tag: tag.clone(),
            shape,
            shape_name,
            carries: Box::new(move |event: &E| unwrap(event).is_some()),
            encode: Box::new(move |event: &E| unwrap(event).map(serde_json::to_value)),
            decode: Box::new(move |value: Value| serde_json::from_value::<T>(value).map(wrap)),
        };

        let index = self.codecs.len();
        self.codecs.push(codec);
        self.by_tag.insert(tag.clone(), index);
        self.by_shape.insert(shape, index);

        tracing::debug!(event_type = %tag, shape = shape_name, "Registered event type");

        Ok(self)
    }

    /// Tag bound to the shape `T`, if any.
    pub fn tag_for<T: 'static>(&self) -> Option<&str> {
        self.by_shape
            .get(&TypeId::of::<T>())
            .map(|&index| self.codecs[index].tag.as_str())
    }

    /// Tag of the shape carried by `event`, if that shape is registered.
    pub fn tag_of(&self, event: &E) -> Option<&str> {
        self.codec_of(event).map(|codec| codec.tag.as_str())
    }

    fn codec_of(&self, event: &E) -> Option<&EventCodec<E>> {
        self.codecs.iter().find(|codec| (codec.carries)(event))
    }

    /// Rust type name of the shape bound to `tag`.
    pub fn shape_name(&self, tag: &str) -> Option<&'static str> {
        self.by_tag.get(tag).map(|&index| self.codecs[index].shape_name)
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.codecs.iter().map(|codec| codec.tag.as_str())
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Encode `event` to JSON, returning its tag alongside.
    pub(crate) fn encode(&self, event: &E) -> Result<(&str, Value), SerializationError> {
        let unregistered = || SerializationError::UnregisteredShape(format!("{:?}", event));

        let codec = self.codec_of(event).ok_or_else(unregistered)?;
        let value = (codec.encode)(event)
            .ok_or_else(unregistered)?
            .map_err(|e| SerializationError::InvalidPayload {
                event_type: codec.tag.clone(),
                reason: e.to_string(),
            })?;

        Ok((codec.tag.as_str(), value))
    }

    /// Decode the JSON payload of a `tag` event.
    pub(crate) fn decode(&self, tag: &str, value: Value) -> Result<E, SerializationError> {
        let index = self
            .by_tag
            .get(tag)
            .ok_or_else(|| SerializationError::UnknownEventType(tag.to_string()))?;

        (self.codecs[*index].decode)(value).map_err(|e| SerializationError::InvalidPayload {
            event_type: tag.to_string(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::SerializeStruct;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Opened {
        owner: String,
    }

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Closed {
        reason: Option<String>,
    }

    #[derive(Clone, Debug, PartialEq)]
    enum AccountEvent {
        Opened(Opened),
        Closed(Closed),
    }

    impl AccountEvent {
        fn as_opened(&self) -> Option<&Opened> {
            match self {
                AccountEvent::Opened(e) => Some(e),
                _ => None,
            }
        }

        fn as_closed(&self) -> Option<&Closed> {
            match self {
                AccountEvent::Closed(e) => Some(e),
                _ => None,
            }
        }
    }

    fn registry() -> TypeRegistry<AccountEvent> {
        let mut registry = TypeRegistry::new();
        registry
            .register("AccountOpened", AccountEvent::Opened, AccountEvent::as_opened)
            .unwrap()
            .register("AccountClosed", AccountEvent::Closed, AccountEvent::as_closed)
            .unwrap();
        registry
    }

    #[test]
    fn test_lookup_both_ways() {
        let registry = registry();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tag_for::<Opened>(), Some("AccountOpened"));
        assert_eq!(registry.tag_for::<Closed>(), Some("AccountClosed"));
        assert!(registry.shape_name("AccountOpened").unwrap().ends_with("Opened"));

        let event = AccountEvent::Closed(Closed { reason: None });
        assert_eq!(registry.tag_of(&event), Some("AccountClosed"));
    }

    #[test]
    fn test_reregistering_same_binding_is_idempotent() {
        let mut registry = registry();
        let result = registry.register("AccountOpened", AccountEvent::Opened, AccountEvent::as_opened);

        assert!(result.is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_tag_bound_to_other_shape_is_rejected() {
        let mut registry = registry();
        let result = registry.register("AccountOpened", AccountEvent::Closed, AccountEvent::as_closed);

        match result {
            Err(RegistryError::TypeConflict { tag, .. }) => assert_eq!(tag, "AccountOpened"),
            _ => panic!("Expected TypeConflict"),
        }
    }

    #[test]
    fn test_shape_under_second_tag_is_rejected() {
        let mut registry = registry();
        let result = registry.register("AccountOpenedV2", AccountEvent::Opened, AccountEvent::as_opened);

        assert!(matches!(result, Err(RegistryError::ShapeConflict { .. })));
        assert!(!registry.contains_tag("AccountOpenedV2"));
    }

    #[test]
    fn test_encode_decode_through_closures() {
        let registry = registry();
        let event = AccountEvent::Opened(Opened { owner: "ada".to_string() });

        let (tag, value) = registry.encode(&event).unwrap();
        assert_eq!(tag, "AccountOpened");

        let decoded = registry.decode(tag, value).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_unknown_tag() {
        let registry = registry();
        let result = registry.decode("AccountFrozen", Value::Null);

        assert_eq!(result, Err(SerializationError::UnknownEventType("AccountFrozen".to_string())));
    }

    static METERED_ENCODES: AtomicUsize = AtomicUsize::new(0);

    /// Shape that counts how many times it is serialized.
    #[derive(Deserialize, Clone, Debug, PartialEq)]
    struct Metered {
        value: u32,
    }

    impl Serialize for Metered {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            METERED_ENCODES.fetch_add(1, Ordering::SeqCst);
            let mut state = serializer.serialize_struct("Metered", 1)?;
            state.serialize_field("value", &self.value)?;
            state.end()
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum MeteredEvent {
        Metered(Metered),
    }

    fn as_metered(event: &MeteredEvent) -> Option<&Metered> {
        match event {
            MeteredEvent::Metered(e) => Some(e),
        }
    }

    #[test]
    fn test_tag_lookup_does_not_serialize_payload() {
        let mut registry = TypeRegistry::new();
        registry.register("Metered", MeteredEvent::Metered, as_metered).unwrap();
        let event = MeteredEvent::Metered(Metered { value: 7 });

        assert_eq!(registry.tag_of(&event), Some("Metered"));
        assert_eq!(METERED_ENCODES.load(Ordering::SeqCst), 0);

        let (tag, value) = registry.encode(&event).unwrap();
        assert_eq!(tag, "Metered");
        assert_eq!(value["value"], 7);
        assert_eq!(METERED_ENCODES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_encode_unregistered_shape() {
        let mut registry: TypeRegistry<AccountEvent> = TypeRegistry::new();
        registry
            .register("AccountOpened", AccountEvent::Opened, AccountEvent::as_opened)
            .unwrap();

        let result = registry.encode(&AccountEvent::Closed(Closed { reason: None }));
        assert!(matches!(result, Err(SerializationError::UnregisteredShape(_))));
    }
}
