//! The bus façade: the single entry point a host application holds onto to
//! publish events, cancel scheduled publishes, start/stop consuming, and
//! probe transport health.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::context::{
    EventContext, HostInfo, HEADER_ACTIVITY_ID, HEADER_CORRELATION_ID, HEADER_ID,
};
use crate::registry::{EventRegistrationStore, RegistrationError};
use crate::serializer::{SerializerError, WireEnvelope};
use crate::transport::{OutboundMessage, ScheduledMarker, TransportError, TransportRuntime};
use relaybus_runtime::metrics::BusMetrics;

/// Errors surfaced by [`Bus`] operations.
#[derive(Error, Debug)]
pub enum BusError {
    /// The bus was constructed from a registration store that was never
    /// frozen.
    #[error("the registration store must be frozen before building a Bus")]
    NotFrozen,
    /// No registration exists for the event type being published or
    /// canceled.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// The registration's transport name has no matching entry in the
    /// bus's transport map.
    #[error("no transport wired up under the name '{0}'")]
    UnknownTransport(String),
    /// The event payload could not be serialized or deserialized.
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    /// The transport rejected the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The event-bus façade. Built once at startup from a frozen
/// [`EventRegistrationStore`] and a map of named transports, then shared
/// (typically behind an `Arc`) across the application.
pub struct Bus {
    registry: EventRegistrationStore,
    transports: HashMap<String, Arc<TransportRuntime>>,
    host_info: HostInfo,
}

impl Bus {
    /// Build a bus from a frozen registration store and its wired-up
    /// transports.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NotFrozen`] if `registry` was never frozen.
    pub fn new(
        registry: EventRegistrationStore,
        transports: HashMap<String, Arc<TransportRuntime>>,
        host_info: HostInfo,
    ) -> Result<Self, BusError> {
        if !registry.is_frozen() {
            return Err(BusError::NotFrozen);
        }
        Ok(Self {
            registry,
            transports,
            host_info,
        })
    }

    fn transport_for(&self, transport_name: &str) -> Result<&Arc<TransportRuntime>, BusError> {
        self.transports
            .get(transport_name)
            .ok_or_else(|| BusError::UnknownTransport(transport_name.to_string()))
    }

    /// Publish one event, optionally scheduling delivery for a future
    /// instant.
    ///
    /// Assigns `context.id` and `context.sent` if absent, injects the
    /// reserved `Id`/`CorrelationId`/`ActivityId` headers, serializes the
    /// context with the registration's serializer, and hands the bytes to
    /// the owning transport, retrying transient failures per the
    /// transport's configured retry policy.
    ///
    /// `scheduled`, when set, is converted to a delay relative to now and
    /// passed to the transport; a `scheduled` instant already in the past
    /// publishes immediately. Returns the broker-assigned
    /// [`ScheduledMarker`] when the transport accepted the message as a
    /// schedulable send, so the caller can later [`Self::cancel`] it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Registration`] if `T` was never registered,
    /// [`BusError::Serializer`] if serialization fails, or
    /// [`BusError::Transport`] if the broker rejects the publish after
    /// retries are exhausted.
    #[instrument(skip(self, context), fields(event_type = std::any::type_name::<T>()))]
    pub async fn publish<T: Serialize + 'static>(
        &self,
        mut context: EventContext<T>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Option<ScheduledMarker>, BusError> {
        let registration = self.registry.get_by_event_type::<T>()?;
        context.finalize_for_publish(|| Uuid::new_v4().to_string(), chrono::Utc::now);

        if let Some(id) = context.id.clone() {
            context.headers.insert(HEADER_ID.to_string(), id);
        }
        if let Some(correlation_id) = context.correlation_id.clone() {
            context
                .headers
                .insert(HEADER_CORRELATION_ID.to_string(), correlation_id);
        }
        context
            .headers
            .entry(HEADER_ACTIVITY_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());

        let event_name = registration
            .event_name()
            .expect("registry is frozen, every registration has a derived name")
            .to_string();
        let transport_name = registration.transport_name().to_string();
        let serializer = registration.serializer();

        let envelope = WireEnvelope::from_context(&context)?;
        let (bytes, content_type) = serializer.serialize(&envelope, &self.host_info)?;
        let delay = scheduled.and_then(|at| (at - Utc::now()).to_std().ok());

        let transport = self.transport_for(&transport_name)?;
        let started = Instant::now();
        let marker = transport
            .publish_with_retry(OutboundMessage {
                event_name: &event_name,
                body: &bytes,
                content_type: &content_type,
                headers: &context.headers,
                delay,
            })
            .await
            .inspect_err(|_| BusMetrics::record_publish_error())?;
        BusMetrics::record_publish(started.elapsed());

        info!(event_name = %event_name, "published");
        Ok(marker)
    }

    /// Publish every context in `contexts`, in order, stopping at the
    /// first failure. `scheduled` applies to the whole batch alike.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; earlier contexts in the batch
    /// have already been published and are not rolled back.
    pub async fn publish_many<T: Serialize + 'static>(
        &self,
        contexts: Vec<EventContext<T>>,
        scheduled: Option<DateTime<Utc>>,
    ) -> Result<Vec<Option<ScheduledMarker>>, BusError> {
        let mut markers = Vec::with_capacity(contexts.len());
        for context in contexts {
            markers.push(self.publish(context, scheduled).await?);
        }
        Ok(markers)
    }

    /// Cancel a previously scheduled publish for event type `T`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Registration`] if `T` was never registered, or
    /// [`BusError::Transport`] (typically
    /// [`TransportError::Unsupported`] or
    /// [`TransportError::CancelNotFound`]) otherwise.
    pub async fn cancel<T: 'static>(&self, marker: &ScheduledMarker) -> Result<(), BusError> {
        let registration = self.registry.get_by_event_type::<T>()?;
        let event_name = registration
            .event_name()
            .expect("registry is frozen, every registration has a derived name");
        let transport = self.transport_for(registration.transport_name())?;
        transport.broker().cancel_scheduled(event_name, marker).await?;
        Ok(())
    }

    /// Provision every registered entity and start every registered
    /// consumer across every wired transport, then open every transport's
    /// readiness gate so their receive loops begin dispatching.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownTransport`] if a registration references
    /// a transport absent from the bus's transport map, or
    /// [`BusError::Transport`] if provisioning or starting a consumer
    /// fails.
    pub async fn start(&self) -> Result<(), BusError> {
        for registration in self.registry.all() {
            let transport = self.transport_for(registration.transport_name())?;
            let event_name = registration
                .event_name()
                .expect("registry is frozen, every registration has a derived name");

            transport
                .broker()
                .provision_entity(event_name, registration.entity_kind(), None)
                .await?;

            for consumer in registration.consumers() {
                let consumer_name = consumer
                    .consumer_name()
                    .expect("registry is frozen, every consumer has a derived name");

                transport
                    .broker()
                    .provision_entity(event_name, registration.entity_kind(), Some(consumer_name))
                    .await?;

                transport
                    .start_consuming(
                        event_name,
                        consumer_name,
                        registration.entity_kind(),
                        registration.serializer(),
                        consumer.dispatcher().clone(),
                        consumer.unhandled_error_behavior(),
                    )
                    .await?;

                info!(event_name = %event_name, consumer_name = %consumer_name, "consumer started");
            }
        }

        for transport in self.transports.values() {
            transport.mark_ready();
        }
        Ok(())
    }

    /// Stop every registered consumer across every wired transport,
    /// letting in-flight dispatches finish.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownTransport`] or [`BusError::Transport`] if
    /// a transport fails to stop cleanly.
    pub async fn stop(&self) -> Result<(), BusError> {
        for registration in self.registry.all() {
            let transport = self.transport_for(registration.transport_name())?;
            let event_name = registration
                .event_name()
                .expect("registry is frozen, every registration has a derived name");

            for consumer in registration.consumers() {
                let consumer_name = consumer
                    .consumer_name()
                    .expect("registry is frozen, every consumer has a derived name");
                transport.broker().stop_consuming(event_name, consumer_name).await?;
                info!(event_name = %event_name, consumer_name = %consumer_name, "consumer stopped");
            }
        }
        Ok(())
    }

    /// Probe connectivity for every distinct wired transport.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransportError`] surfaced by any transport's
    /// health check.
    pub async fn check_health(&self) -> Result<(), BusError> {
        for transport in self.transports.values() {
            transport.broker().health_check().await?;
        }
        Ok(())
    }
}
