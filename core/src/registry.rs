//! The registration store: holds [`EventRegistration`] and its child
//! [`EventConsumerRegistration`]s, resolves by event type, and exposes
//! per-transport filtered views.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::naming::NamingOptions;
use crate::serializer::{JsonSerializer, Serializer, WireEnvelope};

/// A boxed, `Send` future, used for the type-erased consumer dispatcher.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Whether an event is fanned out to every subscriber (broadcast) or
/// delivered to exactly one consumer of a shared queue (point-to-point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Topic + subscription style fan-out.
    Broadcast,
    /// Single queue, competing consumers.
    PointToPoint,
}

/// What a transport should do when a consumer invocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnhandledErrorBehavior {
    /// Route the message to the dead-letter destination.
    DeadLetter,
    /// Acknowledge and drop the message.
    Discard,
    /// Negative-acknowledge (requeue if the broker supports it) or re-raise.
    Fail,
}

/// Outcome of invoking a consumer's dispatcher against one raw message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The consumer processed the message successfully; acknowledge it.
    Ack,
    /// The consumer failed; apply the registration's
    /// [`UnhandledErrorBehavior`].
    Failed(String),
}

/// Error produced by a consumer's dispatcher (deserialization or the
/// consumer's own logic failing).
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The message body could not be deserialized into the consumer's event
    /// type.
    #[error("failed to deserialize message: {0}")]
    Deserialize(String),
    /// The consumer itself returned an error.
    #[error("consumer failed: {0}")]
    Consumer(String),
}

/// A type-erased, registration-time-constructed dispatcher: given a raw
/// deserialized [`WireEnvelope`], resolve the consumer and invoke it.
///
/// Built once at [`EventRegistrationStore::add_consumer`] time, capturing
/// the concrete event and consumer types in a closure so the receive loop
/// never performs runtime type construction.
#[derive(Clone)]
pub struct ConsumeDispatcher {
    dispatch: Arc<
        dyn Fn(WireEnvelope) -> BoxFuture<'static, Result<DispatchOutcome, DispatchError>>
            + Send
            + Sync,
    >,
}

impl ConsumeDispatcher {
    /// Build a dispatcher from a type-erasing closure. Transport crates
    /// never call this directly; it is produced by
    /// [`EventRegistrationStore::add_consumer`].
    pub fn new<F, Fut>(dispatch: F) -> Self
    where
        F: Fn(WireEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchOutcome, DispatchError>> + Send + 'static,
    {
        Self {
            dispatch: Arc::new(move |envelope| Box::pin(dispatch(envelope))),
        }
    }

    /// Invoke the dispatcher against a raw envelope.
    pub fn invoke(&self, envelope: WireEnvelope) -> BoxFuture<'static, Result<DispatchOutcome, DispatchError>> {
        (self.dispatch)(envelope)
    }
}

/// A consumer bound to a parent [`EventRegistration`].
pub struct EventConsumerRegistration {
    consumer_type_id: TypeId,
    consumer_type_name: &'static str,
    name_override: Option<String>,
    consumer_name: Option<String>,
    pub(crate) unhandled_error_behavior: UnhandledErrorBehavior,
    pub(crate) dispatcher: ConsumeDispatcher,
}

impl EventConsumerRegistration {
    /// The consumer type's `TypeId`, used for duplicate detection.
    #[must_use]
    pub fn consumer_type_id(&self) -> TypeId {
        self.consumer_type_id
    }

    /// The raw Rust type path of the consumer, before naming derivation.
    #[must_use]
    pub fn consumer_type_name(&self) -> &'static str {
        self.consumer_type_name
    }

    /// The derived, stable on-the-wire consumer name. `None` until
    /// [`EventRegistrationStore::freeze`] has run.
    #[must_use]
    pub fn consumer_name(&self) -> Option<&str> {
        self.consumer_name.as_deref()
    }

    /// The configured behavior when this consumer's invocation fails.
    #[must_use]
    pub fn unhandled_error_behavior(&self) -> UnhandledErrorBehavior {
        self.unhandled_error_behavior
    }

    /// The type-erased dispatcher for invoking this consumer.
    #[must_use]
    pub fn dispatcher(&self) -> &ConsumeDispatcher {
        &self.dispatcher
    }
}

/// A configured binding from an event payload shape to a wire name,
/// transport, serializer, and set of consumers.
pub struct EventRegistration {
    event_type_id: TypeId,
    event_type_name: &'static str,
    name_override: Option<String>,
    event_name: Option<String>,
    transport_name: String,
    entity_kind: EntityKind,
    serializer: Arc<dyn Serializer>,
    consumers: Vec<EventConsumerRegistration>,
}

impl EventRegistration {
    /// The event type's `TypeId`, used as the registry's primary key.
    #[must_use]
    pub fn event_type_id(&self) -> TypeId {
        self.event_type_id
    }

    /// The raw Rust type path of the event, before naming derivation.
    #[must_use]
    pub fn event_type_name(&self) -> &'static str {
        self.event_type_name
    }

    /// The derived, stable on-the-wire event name. `None` until
    /// [`EventRegistrationStore::freeze`] has run.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        self.event_name.as_deref()
    }

    /// The name of the transport that owns this registration.
    #[must_use]
    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    /// Whether this event fans out to every subscriber or is delivered
    /// point-to-point.
    #[must_use]
    pub fn entity_kind(&self) -> EntityKind {
        self.entity_kind
    }

    /// The serializer bound to this registration.
    #[must_use]
    pub fn serializer(&self) -> Arc<dyn Serializer> {
        Arc::clone(&self.serializer)
    }

    /// The consumers registered under this event, in registration order.
    #[must_use]
    pub fn consumers(&self) -> &[EventConsumerRegistration] {
        &self.consumers
    }

    /// Override the serializer used for this registration (defaults to the
    /// bus-wide default).
    pub fn set_serializer(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializer = serializer;
    }

    /// Set an explicit name override, bypassing type-name-derived naming
    /// (still subject to sanitization at freeze time).
    pub fn set_name_override(&mut self, name: impl Into<String>) {
        self.name_override = Some(name.into());
    }
}

/// Errors returned while resolving a registration.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// No registration exists for the requested event type.
    #[error("unknown event type: {0}")]
    UnknownEvent(&'static str),
    /// A consumer type was registered twice for the same event.
    #[error("consumer {0} is already registered for this event")]
    DuplicateConsumerType(&'static str),
}

/// Errors surfaced by [`EventRegistrationStore::freeze`].
#[derive(Error, Debug)]
pub enum FreezeError {
    /// Two registrations on the same transport derived the same event name.
    #[error("duplicate event name '{name}' on transport '{transport}'")]
    DuplicateEventName {
        /// The colliding derived name.
        name: String,
        /// The transport both registrations are bound to.
        transport: String,
    },
    /// Two consumers under one event derived the same consumer name.
    #[error("duplicate consumer name '{name}' under event '{event}'")]
    DuplicateConsumerName {
        /// The colliding derived name.
        name: String,
        /// The event the consumers are both bound to.
        event: String,
    },
    /// A derived name exceeded a transport-imposed length ceiling (e.g.
    /// Service Bus's 50-character entity name ceiling).
    #[error("name '{name}' exceeds the {limit}-character ceiling imposed by transport '{transport}'")]
    NameTooLong {
        /// The derived name that was too long.
        name: String,
        /// The transport imposing the ceiling.
        transport: String,
        /// The ceiling itself.
        limit: usize,
    },
    /// A registration referenced a transport name with no known owner.
    #[error("no transport registered under the name '{0}'")]
    NoTransport(String),
}

/// Holds every [`EventRegistration`] for a bus instance. Written only during
/// configuration; frozen (read-only) thereafter.
#[derive(Default)]
pub struct EventRegistrationStore {
    registrations: HashMap<TypeId, EventRegistration>,
    order: Vec<TypeId>,
    frozen: bool,
}

impl EventRegistrationStore {
    /// Create an empty, unfrozen store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-fetch) the binding for event type `T` on
    /// `transport_name`. Idempotent per event type: a second call for the
    /// same `T` reuses the existing registration.
    pub fn register<T: 'static>(
        &mut self,
        transport_name: impl Into<String>,
        entity_kind: EntityKind,
    ) -> &mut EventRegistration {
        let type_id = TypeId::of::<T>();
        if !self.registrations.contains_key(&type_id) {
            self.registrations.insert(
                type_id,
                EventRegistration {
                    event_type_id: type_id,
                    event_type_name: std::any::type_name::<T>(),
                    name_override: None,
                    event_name: None,
                    transport_name: transport_name.into(),
                    entity_kind,
                    serializer: Arc::new(JsonSerializer),
                    consumers: Vec::new(),
                },
            );
            self.order.push(type_id);
        }
        self.registrations
            .get_mut(&type_id)
            .expect("just inserted or already present")
    }

    /// Append a consumer registration to event type `T`'s registration.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::UnknownEvent`] if `T` has not been
    /// registered yet, or [`RegistrationError::DuplicateConsumerType`] if
    /// `C` is already registered under this event.
    pub fn add_consumer<T: 'static, C: 'static>(
        &mut self,
        behavior: UnhandledErrorBehavior,
        dispatcher: ConsumeDispatcher,
    ) -> Result<(), RegistrationError> {
        let type_id = TypeId::of::<T>();
        let consumer_type_id = TypeId::of::<C>();
        let registration = self
            .registrations
            .get_mut(&type_id)
            .ok_or(RegistrationError::UnknownEvent(std::any::type_name::<T>()))?;

        if registration
            .consumers
            .iter()
            .any(|c| c.consumer_type_id == consumer_type_id)
        {
            return Err(RegistrationError::DuplicateConsumerType(
                std::any::type_name::<C>(),
            ));
        }

        registration.consumers.push(EventConsumerRegistration {
            consumer_type_id,
            consumer_type_name: std::any::type_name::<C>(),
            name_override: None,
            consumer_name: None,
            unhandled_error_behavior: behavior,
            dispatcher,
        });
        Ok(())
    }

    /// Set a name override for consumer `C` under event `T`, to be honored
    /// at the next [`Self::freeze`].
    pub fn set_consumer_name_override<T: 'static, C: 'static>(&mut self, name: impl Into<String>) {
        let consumer_type_id = TypeId::of::<C>();
        if let Some(registration) = self.registrations.get_mut(&TypeId::of::<T>()) {
            if let Some(consumer) = registration
                .consumers
                .iter_mut()
                .find(|c| c.consumer_type_id == consumer_type_id)
            {
                consumer.name_override = Some(name.into());
            }
        }
    }

    /// Look up the registration for event type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::UnknownEvent`] if absent.
    pub fn get_by_event_type<T: 'static>(&self) -> Result<&EventRegistration, RegistrationError> {
        self.registrations
            .get(&TypeId::of::<T>())
            .ok_or(RegistrationError::UnknownEvent(std::any::type_name::<T>()))
    }

    /// All registrations bound to `transport_name`, in registration order.
    #[must_use]
    pub fn get_by_transport(&self, transport_name: &str) -> Vec<&EventRegistration> {
        self.order
            .iter()
            .filter_map(|id| self.registrations.get(id))
            .filter(|r| r.transport_name == transport_name)
            .collect()
    }

    /// Every registration, in registration order.
    pub fn all(&self) -> impl Iterator<Item = &EventRegistration> {
        self.order
            .iter()
            .filter_map(|id| self.registrations.get(id))
    }

    /// Every distinct transport name referenced by a registration.
    #[must_use]
    pub fn transport_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registrations
            .values()
            .map(|r| r.transport_name.clone())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Whether [`Self::freeze`] has already run successfully.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Derive and bind every registration's `event_name` and every
    /// consumer's `consumer_name`, then validate name uniqueness and
    /// length constraints.
    ///
    /// `transport_name_limits` maps a transport name to an optional
    /// character ceiling on derived names (Service Bus imposes 50; other
    /// transports pass `None`).
    ///
    /// # Errors
    ///
    /// Returns the first [`FreezeError`] encountered.
    pub fn freeze(
        &mut self,
        naming: &NamingOptions,
        application_name: &str,
        transport_name_limits: &HashMap<String, Option<usize>>,
    ) -> Result<(), FreezeError> {
        for type_id in &self.order {
            let registration = self
                .registrations
                .get_mut(type_id)
                .expect("order only contains known keys");

            if !transport_name_limits.contains_key(&registration.transport_name) {
                return Err(FreezeError::NoTransport(registration.transport_name.clone()));
            }

            let event_name = crate::naming::derive_event_name(
                registration.event_type_name,
                registration.name_override.as_deref(),
                naming,
            );

            if let Some(Some(limit)) = transport_name_limits.get(&registration.transport_name) {
                if event_name.len() > *limit {
                    return Err(FreezeError::NameTooLong {
                        name: event_name,
                        transport: registration.transport_name.clone(),
                        limit: *limit,
                    });
                }
            }

            for consumer in &mut registration.consumers {
                let consumer_name = crate::naming::derive_consumer_name(
                    consumer.consumer_type_name,
                    &event_name,
                    consumer.name_override.as_deref(),
                    application_name,
                    naming,
                );
                if let Some(Some(limit)) = transport_name_limits.get(&registration.transport_name) {
                    if consumer_name.len() > *limit {
                        return Err(FreezeError::NameTooLong {
                            name: consumer_name,
                            transport: registration.transport_name.clone(),
                            limit: *limit,
                        });
                    }
                }
                consumer.consumer_name = Some(consumer_name);
            }

            registration.event_name = Some(event_name);
        }

        self.validate_uniqueness()?;
        self.frozen = true;
        Ok(())
    }

    fn validate_uniqueness(&self) -> Result<(), FreezeError> {
        let mut seen_events: HashMap<(&str, &str), ()> = HashMap::new();
        for registration in self.registrations.values() {
            let event_name = registration
                .event_name
                .as_deref()
                .unwrap_or(registration.event_type_name);
            let key = (registration.transport_name.as_str(), event_name);
            if seen_events.insert(key, ()).is_some() {
                return Err(FreezeError::DuplicateEventName {
                    name: event_name.to_string(),
                    transport: registration.transport_name.clone(),
                });
            }

            let mut seen_consumers: HashMap<&str, ()> = HashMap::new();
            for consumer in &registration.consumers {
                let consumer_name = consumer
                    .consumer_name
                    .as_deref()
                    .unwrap_or(consumer.consumer_type_name);
                if seen_consumers.insert(consumer_name, ()).is_some() {
                    return Err(FreezeError::DuplicateConsumerName {
                        name: consumer_name.to_string(),
                        event: event_name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SampleEvent;
    struct SampleConsumer;
    struct OtherConsumer;

    fn noop_dispatcher() -> ConsumeDispatcher {
        ConsumeDispatcher::new(|_envelope| async { Ok(DispatchOutcome::Ack) })
    }

    #[test]
    fn register_is_idempotent_per_event_type() {
        let mut store = EventRegistrationStore::new();
        store.register::<SampleEvent>("memory", EntityKind::Broadcast);
        store.register::<SampleEvent>("memory", EntityKind::Broadcast);
        assert_eq!(store.order.len(), 1);
    }

    #[test]
    fn add_consumer_rejects_unknown_event() {
        let mut store = EventRegistrationStore::new();
        let err = store
            .add_consumer::<SampleEvent, SampleConsumer>(
                UnhandledErrorBehavior::DeadLetter,
                noop_dispatcher(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownEvent(_)));
    }

    #[test]
    fn add_consumer_rejects_duplicate_consumer_type() {
        let mut store = EventRegistrationStore::new();
        store.register::<SampleEvent>("memory", EntityKind::Broadcast);
        store
            .add_consumer::<SampleEvent, SampleConsumer>(
                UnhandledErrorBehavior::DeadLetter,
                noop_dispatcher(),
            )
            .unwrap();
        let err = store
            .add_consumer::<SampleEvent, SampleConsumer>(
                UnhandledErrorBehavior::DeadLetter,
                noop_dispatcher(),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateConsumerType(_)));
    }

    #[test]
    fn freeze_derives_names_and_rejects_unknown_transport_later_reused() {
        let mut store = EventRegistrationStore::new();
        store.register::<SampleEvent>("memory", EntityKind::Broadcast);
        store
            .add_consumer::<SampleEvent, SampleConsumer>(
                UnhandledErrorBehavior::DeadLetter,
                noop_dispatcher(),
            )
            .unwrap();

        let naming = NamingOptions::builder().build();
        let mut limits = HashMap::new();
        limits.insert("memory".to_string(), None);

        store.freeze(&naming, "my-app", &limits).unwrap();
        assert!(store.is_frozen());
        let registration = store.get_by_event_type::<SampleEvent>().unwrap();
        assert!(registration.event_name().is_some());
        assert!(registration.consumers()[0].consumer_name().is_some());
    }

    #[test]
    fn freeze_rejects_missing_transport() {
        let mut store = EventRegistrationStore::new();
        store.register::<SampleEvent>("ghost-transport", EntityKind::Broadcast);
        let naming = NamingOptions::builder().build();
        let limits = HashMap::new();
        let err = store.freeze(&naming, "my-app", &limits).unwrap_err();
        assert!(matches!(err, FreezeError::NoTransport(_)));
    }

    #[test]
    fn freeze_rejects_names_over_transport_limit() {
        let mut store = EventRegistrationStore::new();
        store.register::<SampleEvent>("servicebus", EntityKind::Broadcast);
        let naming = NamingOptions::builder()
            .use_full_type_names(true)
            .build();
        let mut limits = HashMap::new();
        limits.insert("servicebus".to_string(), Some(10));
        let err = store.freeze(&naming, "my-app", &limits).unwrap_err();
        assert!(matches!(err, FreezeError::NameTooLong { .. }));
    }

    #[test]
    fn unused_consumer_type_suppresses_dead_code_warning() {
        let _ = TypeId::of::<OtherConsumer>();
    }
}
