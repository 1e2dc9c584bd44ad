//! A narrow publish-only facade over [`crate::bus::Bus`], for application
//! code that should be able to emit events but not start, stop, or
//! health-check the underlying transports.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::{Bus, BusError};
use crate::context::EventContext;
use crate::transport::ScheduledMarker;

/// Wraps a shared [`Bus`], exposing only its publish and cancel operations.
///
/// Host applications typically register [`Bus`] for lifecycle management
/// (start/stop/health) and [`Publisher`] for everything else, so most
/// application code only ever depends on the smaller surface.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<Bus>,
}

impl Publisher {
    /// Wrap a shared bus.
    #[must_use]
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Publish a fully built context, preserving any correlation metadata
    /// the caller already set. `scheduled`, when set, delays delivery until
    /// that instant on transports that support scheduling.
    ///
    /// # Errors
    ///
    /// See [`Bus::publish`].
    pub async fn publish<T: Serialize + 'static>(
        &self,
        context: EventContext<T>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduledMarker>, BusError> {
        self.bus.publish(context, scheduled).await
    }

    /// Publish a bare payload, wrapping it in a fresh context with no
    /// inherited correlation. `scheduled`, when set, delays delivery until
    /// that instant on transports that support scheduling.
    ///
    /// # Errors
    ///
    /// See [`Bus::publish`].
    pub async fn publish_event<T: Serialize + 'static>(
        &self,
        event: T,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduledMarker>, BusError> {
        self.bus.publish(EventContext::new(event), scheduled).await
    }

    /// Publish every context in `contexts`, in order, stopping at the first
    /// failure. `scheduled` applies to the whole batch alike.
    ///
    /// # Errors
    ///
    /// See [`Bus::publish_many`].
    pub async fn publish_many<T: Serialize + 'static>(
        &self,
        contexts: Vec<EventContext<T>>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Vec<Option<ScheduledMarker>>, BusError> {
        self.bus.publish_many(contexts, scheduled).await
    }

    /// Cancel a previously scheduled publish for event type `T`.
    ///
    /// # Errors
    ///
    /// See [`Bus::cancel`].
    pub async fn cancel<T: 'static>(&self, marker: &ScheduledMarker) -> Result<(), BusError> {
        self.bus.cancel::<T>(marker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NamingOptions;
    use crate::registry::{EntityKind, EventRegistrationStore};
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SampleEvent {
        value: u32,
    }

    fn build_test_bus() -> Bus {
        let mut store = EventRegistrationStore::new();
        store.register::<SampleEvent>("memory", EntityKind::Broadcast);
        let naming = NamingOptions::builder().build();
        let mut limits = HashMap::new();
        limits.insert("memory".to_string(), None);
        store.freeze(&naming, "test-app", &limits).unwrap();

        let broker: Arc<dyn crate::transport::BrokerOps> = Arc::new(NoopBroker);
        let mut transports = HashMap::new();
        transports.insert(
            "memory".to_string(),
            Arc::new(crate::transport::TransportRuntime::new(broker)),
        );

        Bus::new(store, transports, crate::context::HostInfo::default()).unwrap()
    }

    struct NoopBroker;

    impl crate::transport::BrokerOps for NoopBroker {
        fn provision_entity(
            &self,
            _event_name: &str,
            _entity_kind: EntityKind,
            _consumer_name: Option<&str>,
        ) -> crate::transport::BoxFuture<'_, Result<(), crate::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn publish(
            &self,
            _message: crate::transport::OutboundMessage<'_>,
        ) -> crate::transport::BoxFuture<
            '_,
            Result<Option<ScheduledMarker>, crate::transport::TransportError>,
        > {
            Box::pin(async { Ok(None) })
        }

        fn cancel_scheduled(
            &self,
            _event_name: &str,
            _marker: &ScheduledMarker,
        ) -> crate::transport::BoxFuture<'_, Result<(), crate::transport::TransportError>> {
            Box::pin(async {
                Err(crate::transport::TransportError::Unsupported(
                    "noop".to_string(),
                ))
            })
        }

        fn start_consuming(
            &self,
            _event_name: &str,
            _consumer_name: &str,
            _entity_kind: EntityKind,
            _serializer: Arc<dyn crate::serializer::Serializer>,
            _dispatch: crate::registry::ConsumeDispatcher,
            _unhandled_error_behavior: crate::registry::UnhandledErrorBehavior,
            _readiness: Arc<crate::transport::ReadinessGate>,
        ) -> crate::transport::BoxFuture<'_, Result<(), crate::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn stop_consuming(
            &self,
            _event_name: &str,
            _consumer_name: &str,
        ) -> crate::transport::BoxFuture<'_, Result<(), crate::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn health_check(
            &self,
        ) -> crate::transport::BoxFuture<'_, Result<(), crate::transport::TransportError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn publish_event_assigns_id_and_succeeds() {
        let bus = Arc::new(build_test_bus());
        let publisher = Publisher::new(bus);
        publisher
            .publish_event(SampleEvent { value: 7 }, None)
            .await
            .unwrap();
    }
}
