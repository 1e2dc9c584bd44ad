//! # RelayBus Testing
//!
//! An in-memory [`relaybus_core::transport::BrokerOps`] implementation plus
//! deterministic test doubles (a fixed clock, a sequential id generator),
//! for exercising publish/consume wiring without a real broker connection.
//!
//! ## Example
//!
//! ```ignore
//! use relaybus_testing::InMemoryBroker;
//!
//! let broker = InMemoryBroker::new();
//! // register the broker on a Bus, publish, then assert:
//! let orders: Vec<OrderPlaced> = broker.consumed();
//! assert_eq!(orders.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use relaybus_core::context::Headers;
use relaybus_core::registry::{ConsumeDispatcher, EntityKind, UnhandledErrorBehavior};
use relaybus_core::serializer::{ContentType, Serializer, WireEnvelope};
use relaybus_core::transport::{BoxFuture, BrokerOps, OutboundMessage, ScheduledMarker, TransportError};
use tracing::{debug, warn};

/// Deterministic test doubles for time and identifier generation.
pub mod mocks {
    use super::{DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A clock that always returns the same instant, making time-dependent
    /// assertions reproducible.
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Build a clock fixed at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }

        /// The fixed instant this clock always returns.
        #[must_use]
        pub const fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Build a clock fixed at 2025-01-01T00:00:00Z, for tests that don't
    /// care what the exact instant is as long as it never changes.
    ///
    /// # Panics
    ///
    /// Never, in practice — the timestamp is a hardcoded constant.
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp always parses")
                .with_timezone(&Utc),
        )
    }

    /// Generates `id-1`, `id-2`, ... in order, so assertions on
    /// [`relaybus_core::context::EventContext::id`] don't need a real UUID.
    #[derive(Debug, Default)]
    pub struct SequentialIdGenerator {
        next: AtomicU64,
    }

    impl SequentialIdGenerator {
        /// Build a generator starting at `id-1`.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(1),
            }
        }

        /// Produce the next id in sequence.
        pub fn next_id(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("id-{n}")
        }
    }
}

pub use mocks::{test_clock, FixedClock, SequentialIdGenerator};

struct RegisteredConsumer {
    dispatcher: ConsumeDispatcher,
    unhandled_error_behavior: UnhandledErrorBehavior,
}

/// An in-memory broker: publish dispatches synchronously to every
/// registered consumer of the published event name, and every outcome is
/// recorded for inspection.
///
/// Entity provisioning is a no-op, health checks always succeed, and
/// [`BrokerOps::cancel_scheduled`] always returns
/// [`TransportError::Unsupported`] — this transport has no delay primitive
/// to cancel against.
#[derive(Default)]
pub struct InMemoryBroker {
    published: Mutex<Vec<WireEnvelope>>,
    consumed: Mutex<Vec<WireEnvelope>>,
    failed: Mutex<Vec<(WireEnvelope, String)>>,
    consumers: Mutex<HashMap<(String, String), RegisteredConsumer>>,
}

impl InMemoryBroker {
    /// Build an empty broker with no recorded messages and no consumers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, deserialized as `T`. Messages whose
    /// payload does not decode as `T` are silently skipped.
    #[must_use]
    pub fn published<T: for<'de> serde::Deserialize<'de>>(&self) -> Vec<T> {
        self.published
            .lock()
            .expect("mutex not poisoned")
            .iter()
            .filter_map(|envelope| serde_json::from_value(envelope.event.clone()).ok())
            .collect()
    }

    /// Every message that a registered consumer acknowledged, deserialized
    /// as `T`.
    #[must_use]
    pub fn consumed<T: for<'de> serde::Deserialize<'de>>(&self) -> Vec<T> {
        self.consumed
            .lock()
            .expect("mutex not poisoned")
            .iter()
            .filter_map(|envelope| serde_json::from_value(envelope.event.clone()).ok())
            .collect()
    }

    /// Every message whose dispatcher failed, deserialized as `T` alongside
    /// the failure reason.
    #[must_use]
    pub fn failed<T: for<'de> serde::Deserialize<'de>>(&self) -> Vec<(T, String)> {
        self.failed
            .lock()
            .expect("mutex not poisoned")
            .iter()
            .filter_map(|(envelope, reason)| {
                serde_json::from_value(envelope.event.clone())
                    .ok()
                    .map(|event| (event, reason.clone()))
            })
            .collect()
    }

    /// Clear every recorded message, without unregistering consumers.
    pub fn reset(&self) {
        self.published.lock().expect("mutex not poisoned").clear();
        self.consumed.lock().expect("mutex not poisoned").clear();
        self.failed.lock().expect("mutex not poisoned").clear();
    }
}

impl BrokerOps for InMemoryBroker {
    fn provision_entity(
        &self,
        _event_name: &str,
        _entity_kind: EntityKind,
        _consumer_name: Option<&str>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn publish(
        &self,
        message: OutboundMessage<'_>,
    ) -> BoxFuture<'_, Result<Option<ScheduledMarker>, TransportError>> {
        let event_name = message.event_name.to_string();
        let envelope: Result<WireEnvelope, _> = serde_json::from_slice(message.body);
        let delay = message.delay;
        Box::pin(async move {
            let envelope = envelope.map_err(|e| TransportError::PublishFailed(e.to_string()))?;

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.published
                .lock()
                .expect("mutex not poisoned")
                .push(envelope.clone());

            let consumers = self.consumers.lock().expect("mutex not poisoned");
            let matching: Vec<&RegisteredConsumer> = consumers
                .iter()
                .filter(|((name, _), _)| *name == event_name)
                .map(|(_, consumer)| consumer)
                .collect();

            for consumer in matching {
                // Fresh DI scope per consumer: a new id, correlation inherited
                // from the published envelope's own id.
                let mut consume_envelope = envelope.clone();
                consume_envelope.id = Some(uuid::Uuid::new_v4().to_string());
                consume_envelope.correlation_id = envelope.id.clone();

                debug!(event_name = %event_name, "dispatching in-memory message to consumer");
                match consumer.dispatcher.invoke(consume_envelope.clone()).await {
                    Ok(outcome) => match outcome {
                        relaybus_core::registry::DispatchOutcome::Ack => {
                            self.consumed
                                .lock()
                                .expect("mutex not poisoned")
                                .push(consume_envelope);
                        }
                        relaybus_core::registry::DispatchOutcome::Failed(reason) => {
                            warn!(event_name = %event_name, reason = %reason, "in-memory consumer failed");
                            self.failed
                                .lock()
                                .expect("mutex not poisoned")
                                .push((consume_envelope, reason));
                        }
                    },
                    Err(err) => {
                        self.failed
                            .lock()
                            .expect("mutex not poisoned")
                            .push((consume_envelope, err.to_string()));
                    }
                }
            }

            Ok(None)
        })
    }

    fn cancel_scheduled(
        &self,
        _event_name: &str,
        _marker: &ScheduledMarker,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async {
            Err(TransportError::Unsupported(
                "the in-memory transport has no scheduling primitive to cancel".to_string(),
            ))
        })
    }

    fn start_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
        _entity_kind: EntityKind,
        _serializer: std::sync::Arc<dyn Serializer>,
        dispatch: ConsumeDispatcher,
        unhandled_error_behavior: UnhandledErrorBehavior,
        _readiness: std::sync::Arc<relaybus_core::transport::ReadinessGate>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let key = (event_name.to_string(), consumer_name.to_string());
        self.consumers.lock().expect("mutex not poisoned").insert(
            key,
            RegisteredConsumer {
                dispatcher: dispatch,
                unhandled_error_behavior,
            },
        );
        Box::pin(async { Ok(()) })
    }

    fn stop_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let key = (event_name.to_string(), consumer_name.to_string());
        self.consumers.lock().expect("mutex not poisoned").remove(&key);
        Box::pin(async { Ok(()) })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Build a self-describing, already-serialized outbound message for tests
/// that want to call [`BrokerOps::publish`] directly without going through
/// a [`relaybus_core::bus::Bus`].
///
/// # Errors
///
/// Returns a `serde_json` error if `event` cannot be encoded.
pub fn encode_test_message<T: serde::Serialize>(
    event_name: &str,
    event: T,
) -> Result<(Vec<u8>, ContentType, Headers), serde_json::Error> {
    let envelope = WireEnvelope {
        id: None,
        request_id: None,
        correlation_id: None,
        conversation_id: None,
        initiator_id: None,
        sent: None,
        expires: None,
        headers: Headers::new(),
        event: serde_json::to_value(event)?,
    };
    let bytes = serde_json::to_vec(&envelope)?;
    let _ = event_name;
    Ok((bytes, ContentType::new("application/json; charset=utf-8"), Headers::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybus_core::registry::DispatchOutcome;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: String,
    }

    fn noop_serializer() -> std::sync::Arc<dyn Serializer> {
        std::sync::Arc::new(relaybus_core::serializer::JsonSerializer)
    }

    #[tokio::test]
    async fn publish_with_no_consumer_just_records_published() {
        let broker = InMemoryBroker::new();
        let (bytes, content_type, headers) =
            encode_test_message("order-placed", OrderPlaced { order_id: "o-1".to_string() }).unwrap();

        broker
            .publish(OutboundMessage {
                event_name: "order-placed",
                body: &bytes,
                content_type: &content_type,
                headers: &headers,
                delay: None,
            })
            .await
            .unwrap();

        let published: Vec<OrderPlaced> = broker.published();
        assert_eq!(published, vec![OrderPlaced { order_id: "o-1".to_string() }]);
        assert!(broker.consumed::<OrderPlaced>().is_empty());
    }

    #[tokio::test]
    async fn publish_dispatches_to_registered_consumer_and_records_outcome() {
        let broker = InMemoryBroker::new();
        let dispatcher = ConsumeDispatcher::new(|_envelope| async { Ok(DispatchOutcome::Ack) });

        broker
            .start_consuming(
                "order-placed",
                "billing-service",
                EntityKind::Broadcast,
                noop_serializer(),
                dispatcher,
                UnhandledErrorBehavior::DeadLetter,
                std::sync::Arc::new(relaybus_core::transport::ReadinessGate::new()),
            )
            .await
            .unwrap();

        let (bytes, content_type, headers) =
            encode_test_message("order-placed", OrderPlaced { order_id: "o-2".to_string() }).unwrap();
        broker
            .publish(OutboundMessage {
                event_name: "order-placed",
                body: &bytes,
                content_type: &content_type,
                headers: &headers,
                delay: None,
            })
            .await
            .unwrap();

        let consumed: Vec<OrderPlaced> = broker.consumed();
        assert_eq!(consumed, vec![OrderPlaced { order_id: "o-2".to_string() }]);
    }

    #[tokio::test]
    async fn failed_dispatch_is_recorded_with_reason() {
        let broker = InMemoryBroker::new();
        let dispatcher = ConsumeDispatcher::new(|_envelope| async {
            Ok(DispatchOutcome::Failed("handler blew up".to_string()))
        });

        broker
            .start_consuming(
                "order-placed",
                "billing-service",
                EntityKind::Broadcast,
                noop_serializer(),
                dispatcher,
                UnhandledErrorBehavior::Fail,
                std::sync::Arc::new(relaybus_core::transport::ReadinessGate::new()),
            )
            .await
            .unwrap();

        let (bytes, content_type, headers) =
            encode_test_message("order-placed", OrderPlaced { order_id: "o-3".to_string() }).unwrap();
        broker
            .publish(OutboundMessage {
                event_name: "order-placed",
                body: &bytes,
                content_type: &content_type,
                headers: &headers,
                delay: None,
            })
            .await
            .unwrap();

        let failed: Vec<(OrderPlaced, String)> = broker.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0.order_id, "o-3");
        assert_eq!(failed[0].1, "handler blew up");
    }

    #[tokio::test]
    async fn dispatch_invokes_a_fresh_context_with_inherited_correlation() {
        let broker = InMemoryBroker::new();
        let seen: std::sync::Arc<Mutex<Option<WireEnvelope>>> = std::sync::Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let dispatcher = ConsumeDispatcher::new(move |envelope| {
            let seen = seen_clone.clone();
            async move {
                *seen.lock().expect("mutex not poisoned") = Some(envelope);
                Ok(DispatchOutcome::Ack)
            }
        });

        broker
            .start_consuming(
                "order-placed",
                "billing-service",
                EntityKind::Broadcast,
                noop_serializer(),
                dispatcher,
                UnhandledErrorBehavior::DeadLetter,
                std::sync::Arc::new(relaybus_core::transport::ReadinessGate::new()),
            )
            .await
            .unwrap();

        let mut headers = Headers::new();
        headers.insert("Id".to_string(), "source-id".to_string());
        let envelope = WireEnvelope {
            id: Some("source-id".to_string()),
            request_id: None,
            correlation_id: None,
            conversation_id: None,
            initiator_id: None,
            sent: None,
            expires: None,
            headers,
            event: serde_json::to_value(OrderPlaced { order_id: "o-4".to_string() }).unwrap(),
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();

        broker
            .publish(OutboundMessage {
                event_name: "order-placed",
                body: &bytes,
                content_type: &ContentType::new("application/json; charset=utf-8"),
                headers: &Headers::new(),
                delay: None,
            })
            .await
            .unwrap();

        let consumed = seen.lock().expect("mutex not poisoned").clone().unwrap();
        assert_ne!(consumed.id, Some("source-id".to_string()));
        assert_eq!(consumed.correlation_id, Some("source-id".to_string()));
    }

    #[tokio::test]
    async fn delayed_publish_dispatches_only_after_the_delay_elapses() {
        let broker = InMemoryBroker::new();
        let dispatcher = ConsumeDispatcher::new(|_envelope| async { Ok(DispatchOutcome::Ack) });

        broker
            .start_consuming(
                "order-placed",
                "billing-service",
                EntityKind::Broadcast,
                noop_serializer(),
                dispatcher,
                UnhandledErrorBehavior::DeadLetter,
                std::sync::Arc::new(relaybus_core::transport::ReadinessGate::new()),
            )
            .await
            .unwrap();

        let (bytes, content_type, headers) =
            encode_test_message("order-placed", OrderPlaced { order_id: "o-5".to_string() }).unwrap();

        let started = std::time::Instant::now();
        broker
            .publish(OutboundMessage {
                event_name: "order-placed",
                body: &bytes,
                content_type: &content_type,
                headers: &headers,
                delay: Some(std::time::Duration::from_millis(50)),
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
        assert_eq!(broker.consumed::<OrderPlaced>().len(), 1);
    }

    #[tokio::test]
    async fn cancel_scheduled_is_unsupported() {
        let broker = InMemoryBroker::new();
        let err = broker
            .cancel_scheduled("order-placed", &ScheduledMarker::new("marker-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }

    #[test]
    fn sequential_id_generator_produces_in_order_ids() {
        let gen = SequentialIdGenerator::new();
        assert_eq!(gen.next_id(), "id-1");
        assert_eq!(gen.next_id(), "id-2");
    }

    #[test]
    fn fixed_clock_always_returns_same_instant() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }
}
