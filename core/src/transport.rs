//! The broker-facing trait every transport crate implements, and the shared
//! publish/consume pipeline built on top of it.
//!
//! [`BrokerOps`] is kept dyn-compatible with explicit `Pin<Box<dyn Future>>`
//! returns, the same shape used throughout this workspace for trait objects
//! that must be stored behind `Arc<dyn Trait>`. [`TransportRuntime`] is the
//! part every transport crate shares: it owns the retry policy, circuit
//! breaker, and readiness gate, and turns a raw inbound message into a
//! dispatcher invocation without any transport-specific code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use relaybus_runtime::metrics::BusMetrics;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::context::Headers;
use crate::registry::{ConsumeDispatcher, DispatchOutcome, EntityKind, UnhandledErrorBehavior};
use crate::serializer::{ContentType, Serializer};

/// A boxed, `Send` future, the return type of every [`BrokerOps`] method.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Opaque broker-assigned handle for a scheduled (delayed) publish,
/// required to later cancel it. Transports that do not support scheduling
/// never construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledMarker(String);

impl ScheduledMarker {
    /// Wrap a raw broker-assigned scheduling token.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token, as handed back to the originating broker's cancel API.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Errors a transport crate's [`BrokerOps`] implementation may raise.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The broker connection could not be established or was lost.
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// A publish attempt was rejected by the broker.
    #[error("publish failed: {0}")]
    PublishFailed(String),
    /// The referenced entity (queue/topic/stream) does not exist and could
    /// not be provisioned.
    #[error("entity provisioning failed for '{entity}': {reason}")]
    ProvisioningFailed {
        /// The entity name that failed to provision.
        entity: String,
        /// The broker-reported reason.
        reason: String,
    },
    /// A scheduled publish could not be canceled, typically because it was
    /// already delivered or the marker is unknown to the broker.
    #[error("cancel failed for marker '{0}': not found or already delivered")]
    CancelNotFound(String),
    /// The transport does not support the requested operation (e.g.
    /// scheduled publish on a broker with no delay primitive).
    #[error("operation not supported by this transport: {0}")]
    Unsupported(String),
    /// The consume loop could not be started or stopped cleanly.
    #[error("consume loop error: {0}")]
    ConsumeLoop(String),
}

/// A single outbound message ready to hand to a broker.
pub struct OutboundMessage<'a> {
    /// The wire name of the event (post-derivation).
    pub event_name: &'a str,
    /// Serialized payload bytes.
    pub body: &'a [u8],
    /// The content type the serializer declared for `body`.
    pub content_type: &'a ContentType,
    /// Transport-agnostic headers to carry alongside the body.
    pub headers: &'a Headers,
    /// How long to delay delivery, if the caller requested a scheduled
    /// publish and the transport supports it.
    pub delay: Option<Duration>,
}

/// What the shared pipeline should do after a consumer dispatcher runs,
/// translated from the dispatcher's [`DispatchOutcome`] and the
/// registration's [`UnhandledErrorBehavior`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAction {
    /// Acknowledge (complete/delete) the message.
    Ack,
    /// Route the message to the dead-letter destination.
    DeadLetter,
    /// Acknowledge without further action, dropping the message.
    Discard,
    /// Negative-acknowledge or leave unacked so the broker redelivers it.
    Requeue,
}

/// Resolve what a transport should do with a message after its dispatcher
/// ran, combining the dispatcher's outcome with the registration's
/// configured failure behavior.
#[must_use]
pub fn resolve_consume_action(
    outcome: &DispatchOutcome,
    behavior: UnhandledErrorBehavior,
) -> ConsumeAction {
    match outcome {
        DispatchOutcome::Ack => ConsumeAction::Ack,
        DispatchOutcome::Failed(reason) => {
            warn!(reason = %reason, "consumer dispatcher failed");
            match behavior {
                UnhandledErrorBehavior::DeadLetter => ConsumeAction::DeadLetter,
                UnhandledErrorBehavior::Discard => ConsumeAction::Discard,
                UnhandledErrorBehavior::Fail => ConsumeAction::Requeue,
            }
        }
    }
}

/// The operations every broker-specific transport crate must implement.
///
/// A `BrokerOps` implementation owns exactly one broker connection (or
/// connection pool) and knows nothing about event naming, serialization, or
/// consumer dispatch — those are handled by [`TransportRuntime`] and the
/// caller. Each method takes `&self` so implementations are expected to be
/// internally synchronized (an `Arc<Mutex<..>>` or a client that is already
/// `Send + Sync`, matching the single-flight client-cache pattern used by
/// every transport crate in this workspace).
pub trait BrokerOps: Send + Sync {
    /// Ensure the named entity (queue, topic, subscription, stream) exists,
    /// creating it if the broker supports on-demand provisioning.
    fn provision_entity(
        &self,
        event_name: &str,
        entity_kind: EntityKind,
        consumer_name: Option<&str>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Publish one message, returning a [`ScheduledMarker`] when `message`
    /// requested a delay and the broker accepted it as a schedulable send.
    fn publish(
        &self,
        message: OutboundMessage<'_>,
    ) -> BoxFuture<'_, Result<Option<ScheduledMarker>, TransportError>>;

    /// Cancel a previously scheduled publish.
    ///
    /// Returns [`TransportError::Unsupported`] for transports with no
    /// scheduling primitive, or [`TransportError::CancelNotFound`] if the
    /// marker is unknown (already delivered, or never valid).
    fn cancel_scheduled(
        &self,
        event_name: &str,
        marker: &ScheduledMarker,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Start consuming `event_name` for `consumer_name`, invoking
    /// `dispatch` for every message the broker delivers until
    /// [`Self::stop_consuming`] is called for the same pair.
    ///
    /// `readiness` MUST be awaited by the receive loop before the first
    /// message is handed to `dispatch`, so consumers never run ahead of the
    /// host's own startup (§4.E).
    fn start_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
        entity_kind: EntityKind,
        serializer: Arc<dyn Serializer>,
        dispatch: ConsumeDispatcher,
        unhandled_error_behavior: UnhandledErrorBehavior,
        readiness: Arc<ReadinessGate>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Stop consuming `event_name` for `consumer_name`, letting any
    /// in-flight dispatch finish before returning.
    fn stop_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Cheap connectivity probe used by [`crate::bus::Bus::check_health`].
    fn health_check(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// One-shot readiness signal a transport flips after its first successful
/// connection, so callers that start consuming immediately after
/// construction can await actual connectivity instead of guessing with a
/// sleep.
#[derive(Default)]
pub struct ReadinessGate {
    notify: Notify,
    ready: std::sync::atomic::AtomicBool,
}

impl ReadinessGate {
    /// Build a gate that is not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the gate ready, waking every waiter. Idempotent.
    pub fn mark_ready(&self) {
        self.ready.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the gate has already been marked ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Wait until the gate is marked ready. Returns immediately if it
    /// already is.
    pub async fn wait(&self) {
        if self.is_ready() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_ready() {
            return;
        }
        notified.await;
    }
}

/// Cooperative cancellation signal for a transport crate's receive loop.
///
/// The mirror image of [`ReadinessGate`]: starts un-signaled, flips exactly
/// once, and every `wait` call after that returns immediately. A transport
/// crate typically holds one `Arc<StopSignal>` per `(event_name,
/// consumer_name)` receive-loop task, handed to the spawned task at
/// `start_consuming` time and flipped by `stop_consuming`.
#[derive(Default)]
pub struct StopSignal {
    notify: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

impl StopSignal {
    /// Build a signal that has not yet fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking every waiter. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether [`Self::stop`] has already been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Resolve once [`Self::stop`] has been called. Returns immediately if
    /// it already has.
    pub async fn wait(&self) {
        if self.is_stopped() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// The shared plumbing every transport crate wraps its [`BrokerOps`]
/// implementation in: retry with backoff around publish, and a readiness
/// gate callers can await before the first publish or consume call.
///
/// Holds its broker behind `Arc<dyn BrokerOps>` (rather than being generic
/// over a concrete broker type) so a [`crate::bus::Bus`] can keep a
/// heterogeneous collection of transports — one per broker — in a single
/// map.
pub struct TransportRuntime {
    broker: Arc<dyn BrokerOps>,
    retry_policy: relaybus_runtime::retry::RetryPolicy,
    readiness: Arc<ReadinessGate>,
}

impl TransportRuntime {
    /// Wrap `broker` with the default retry policy and a fresh readiness
    /// gate.
    pub fn new(broker: Arc<dyn BrokerOps>) -> Self {
        Self {
            broker,
            retry_policy: relaybus_runtime::retry::RetryPolicy::default(),
            readiness: Arc::new(ReadinessGate::new()),
        }
    }

    /// Wrap `broker` with an explicit retry policy.
    pub fn with_retry_policy(
        broker: Arc<dyn BrokerOps>,
        retry_policy: relaybus_runtime::retry::RetryPolicy,
    ) -> Self {
        Self {
            broker,
            retry_policy,
            readiness: Arc::new(ReadinessGate::new()),
        }
    }

    /// The readiness gate callers can await before issuing the first
    /// publish or consume call.
    #[must_use]
    pub fn readiness(&self) -> &ReadinessGate {
        &self.readiness
    }

    /// Mark this runtime ready, typically called by the façade once every
    /// wired transport's `start_consuming` calls have returned.
    pub fn mark_ready(&self) {
        self.readiness.mark_ready();
    }

    /// The wrapped broker implementation.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn BrokerOps> {
        &self.broker
    }

    /// Start consuming `event_name` for `consumer_name`, handing the
    /// broker this runtime's readiness gate so its receive loop waits for
    /// [`Self::mark_ready`] before the first dispatch.
    ///
    /// # Errors
    ///
    /// See [`BrokerOps::start_consuming`].
    #[allow(clippy::too_many_arguments)]
    pub async fn start_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
        entity_kind: EntityKind,
        serializer: Arc<dyn Serializer>,
        dispatch: ConsumeDispatcher,
        unhandled_error_behavior: UnhandledErrorBehavior,
    ) -> Result<(), TransportError> {
        self.broker
            .start_consuming(
                event_name,
                consumer_name,
                entity_kind,
                serializer,
                dispatch,
                unhandled_error_behavior,
                Arc::clone(&self.readiness),
            )
            .await
    }

    /// Publish one message, retrying transient failures per the configured
    /// retry policy. [`TransportError::ProvisioningFailed`] and
    /// [`TransportError::Unsupported`] are not retried; every other variant
    /// is treated as transient.
    pub async fn publish_with_retry(
        &self,
        message: OutboundMessage<'_>,
    ) -> Result<Option<ScheduledMarker>, TransportError> {
        let event_name = message.event_name;
        let body = message.body;
        let content_type = message.content_type;
        let headers = message.headers;
        let delay = message.delay;

        relaybus_runtime::retry::retry_with_predicate(
            self.retry_policy.clone(),
            || async {
                debug!(event_name, "publishing message");
                self.broker
                    .publish(OutboundMessage {
                        event_name,
                        body,
                        content_type,
                        headers,
                        delay,
                    })
                    .await
            },
            |err: &TransportError| {
                !matches!(
                    err,
                    TransportError::ProvisioningFailed { .. } | TransportError::Unsupported(_)
                )
            },
        )
        .await
        .inspect_err(|err| error!(event_name, error = %err, "publish failed after retries"))
    }

}

/// Invoke `dispatcher` against one inbound payload, decoding it through
/// `serializer` first, and resolve the [`ConsumeAction`] the caller's
/// transport should take.
///
/// A free function (not a [`TransportRuntime`] method) so a transport
/// crate's receive loop can call it directly around each message it pulls
/// off the broker, without needing a `TransportRuntime` handle of its own.
pub async fn dispatch_incoming(
    serializer: &dyn Serializer,
    bytes: &[u8],
    content_type: &str,
    dispatcher: &ConsumeDispatcher,
    unhandled_error_behavior: UnhandledErrorBehavior,
) -> ConsumeAction {
    let envelope = match serializer.deserialize(bytes, content_type) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!(error = %err, "failed to deserialize inbound message");
            BusMetrics::record_consume_error();
            return match unhandled_error_behavior {
                UnhandledErrorBehavior::DeadLetter => ConsumeAction::DeadLetter,
                UnhandledErrorBehavior::Discard => ConsumeAction::Discard,
                UnhandledErrorBehavior::Fail => ConsumeAction::Requeue,
            };
        }
    };

    let started = Instant::now();
    let action = match dispatcher.invoke(envelope).await {
        Ok(outcome) => resolve_consume_action(&outcome, unhandled_error_behavior),
        Err(err) => {
            error!(error = %err, "dispatcher returned an error");
            resolve_consume_action(&DispatchOutcome::Failed(err.to_string()), unhandled_error_behavior)
        }
    };

    match action {
        ConsumeAction::Ack | ConsumeAction::Discard => BusMetrics::record_consume(started.elapsed()),
        ConsumeAction::DeadLetter => {
            BusMetrics::record_consume_error();
            BusMetrics::record_deadlettered();
        }
        ConsumeAction::Requeue => BusMetrics::record_consume_error(),
    }

    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConsumeDispatcher, DispatchOutcome, EntityKind};
    use crate::serializer::JsonSerializer;

    struct RecordingBroker {
        seen_readiness: std::sync::Mutex<Option<Arc<ReadinessGate>>>,
    }

    impl BrokerOps for RecordingBroker {
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
            _message: OutboundMessage<'_>,
        ) -> BoxFuture<'_, Result<Option<ScheduledMarker>, TransportError>> {
            Box::pin(async { Ok(None) })
        }

        fn cancel_scheduled(
            &self,
            _event_name: &str,
            _marker: &ScheduledMarker,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Err(TransportError::Unsupported("test".to_string())) })
        }

        fn start_consuming(
            &self,
            _event_name: &str,
            _consumer_name: &str,
            _entity_kind: EntityKind,
            _serializer: Arc<dyn Serializer>,
            _dispatch: ConsumeDispatcher,
            _unhandled_error_behavior: UnhandledErrorBehavior,
            readiness: Arc<ReadinessGate>,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            *self.seen_readiness.lock().expect("not poisoned") = Some(readiness);
            Box::pin(async { Ok(()) })
        }

        fn stop_consuming(
            &self,
            _event_name: &str,
            _consumer_name: &str,
        ) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }

        fn health_check(&self) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn start_consuming_hands_the_broker_this_runtime_own_readiness_gate() {
        let broker = Arc::new(RecordingBroker {
            seen_readiness: std::sync::Mutex::new(None),
        });
        let runtime = TransportRuntime::new(broker.clone());

        runtime
            .start_consuming(
                "event",
                "consumer",
                EntityKind::Broadcast,
                Arc::new(JsonSerializer),
                ConsumeDispatcher::new(|_| async { Ok(DispatchOutcome::Ack) }),
                UnhandledErrorBehavior::DeadLetter,
            )
            .await
            .unwrap();

        let seen = broker
            .seen_readiness
            .lock()
            .expect("not poisoned")
            .clone()
            .expect("start_consuming was called");
        assert!(!seen.is_ready());
        runtime.mark_ready();
        assert!(seen.is_ready());
    }

    #[tokio::test]
    async fn readiness_gate_wait_returns_immediately_once_marked() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_ready());
        gate.mark_ready();
        assert!(gate.is_ready());
        gate.wait().await;
    }

    #[tokio::test]
    async fn readiness_gate_wait_unblocks_after_mark_ready() {
        let gate = Arc::new(ReadinessGate::new());
        let waiter_gate = Arc::clone(&gate);
        let waiter = tokio::spawn(async move {
            waiter_gate.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.mark_ready();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn stop_signal_wait_unblocks_after_stop() {
        let signal = Arc::new(StopSignal::new());
        let waiter_signal = Arc::clone(&signal);
        let waiter = tokio::spawn(async move {
            waiter_signal.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!signal.is_stopped());
        signal.stop();
        waiter.await.unwrap();
        assert!(signal.is_stopped());
    }

    #[test]
    fn resolve_consume_action_maps_ack_regardless_of_behavior() {
        assert_eq!(
            resolve_consume_action(&DispatchOutcome::Ack, UnhandledErrorBehavior::Fail),
            ConsumeAction::Ack
        );
    }

    #[test]
    fn resolve_consume_action_maps_failure_per_behavior() {
        let failed = DispatchOutcome::Failed("boom".to_string());
        assert_eq!(
            resolve_consume_action(&failed, UnhandledErrorBehavior::DeadLetter),
            ConsumeAction::DeadLetter
        );
        assert_eq!(
            resolve_consume_action(&failed, UnhandledErrorBehavior::Discard),
            ConsumeAction::Discard
        );
        assert_eq!(
            resolve_consume_action(&failed, UnhandledErrorBehavior::Fail),
            ConsumeAction::Requeue
        );
    }
}
