//! Azure Queue Storage transport for relaybus.
//!
//! Entity model: one queue per event, plus an optional `<event-name>-
//! deadletter` queue a consumer's failed dispatch is moved to. Scheduled
//! publish rides the service's native visibility-timeout: the enqueue
//! response's `(message_id, pop_receipt)` pair becomes the
//! [`relaybus_core::transport::ScheduledMarker`], serialized as
//! `messageId|popReceipt`; canceling deletes the message by that same pair
//! before it becomes visible. Receiving is a polling loop (§4.F's `{Idle,
//! Polling, Dispatching, Backoff, Stopping}` state machine), since Queue
//! Storage has no push/long-poll primitive.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use azure_storage_queues::{QueueClient, QueueServiceClientBuilder};
use relaybus_core::registry::{ConsumeDispatcher, EntityKind, UnhandledErrorBehavior};
use relaybus_core::serializer::Serializer;
use relaybus_core::transport::{
    BoxFuture, BrokerOps, ConsumeAction, OutboundMessage, ReadinessGate, ScheduledMarker,
    StopSignal, TransportError, dispatch_incoming,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

const DEAD_LETTER_SUFFIX: &str = "-deadletter";
const EMPTY_RESULTS_DELAY: Duration = Duration::from_secs(2);

fn dead_letter_queue_name(event_name: &str) -> String {
    format!("{event_name}{DEAD_LETTER_SUFFIX}")
}

/// Parse a `messageId|popReceipt` marker back into its two parts.
///
/// # Errors
///
/// Returns [`TransportError::CancelNotFound`] if `marker` is not of the
/// shape this transport produces.
fn parse_marker(marker: &ScheduledMarker) -> Result<(String, String), TransportError> {
    marker
        .as_str()
        .split_once('|')
        .map(|(id, pop_receipt)| (id.to_string(), pop_receipt.to_string()))
        .ok_or_else(|| TransportError::CancelNotFound(marker.as_str().to_string()))
}

struct ConsumerTask {
    stop: Arc<StopSignal>,
    handle: tokio::task::JoinHandle<()>,
}

/// Azure Queue Storage-backed [`BrokerOps`] implementation.
pub struct QueueStorageTransport {
    account_url: String,
    queues: AsyncMutex<HashMap<String, Arc<QueueClient>>>,
    consumers: AsyncMutex<HashMap<(String, String), ConsumerTask>>,
}

impl QueueStorageTransport {
    /// Start building a transport against the storage account at
    /// `account_url`, authenticating with [`azure_identity::DefaultAzureCredential`].
    #[must_use]
    pub fn builder(account_url: impl Into<String>) -> QueueStorageTransportBuilder {
        QueueStorageTransportBuilder {
            account_url: account_url.into(),
        }
    }

    async fn queue_for(&self, queue_name: &str) -> Result<Arc<QueueClient>, TransportError> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(queue_name) {
            return Ok(Arc::clone(queue));
        }
        let credential = azure_identity::DefaultAzureCredential::new()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let service = QueueServiceClientBuilder::new(self.account_url.clone(), Arc::new(credential))
            .build()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let queue = Arc::new(service.queue_client(queue_name));
        queue
            .create_if_not_exists()
            .await
            .map_err(|e| TransportError::ProvisioningFailed {
                entity: queue_name.to_string(),
                reason: e.to_string(),
            })?;
        queues.insert(queue_name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }
}

/// Builder for [`QueueStorageTransport`].
pub struct QueueStorageTransportBuilder {
    account_url: String,
}

impl QueueStorageTransportBuilder {
    /// Build the transport. Does not connect eagerly.
    #[must_use]
    pub fn build(self) -> QueueStorageTransport {
        QueueStorageTransport {
            account_url: self.account_url,
            queues: AsyncMutex::new(HashMap::new()),
            consumers: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl BrokerOps for QueueStorageTransport {
    fn provision_entity(
        &self,
        event_name: &str,
        _entity_kind: EntityKind,
        _consumer_name: Option<&str>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let event_name = event_name.to_string();
        Box::pin(async move {
            self.queue_for(&event_name).await?;
            self.queue_for(&dead_letter_queue_name(&event_name)).await?;
            Ok(())
        })
    }

    fn publish(
        &self,
        message: OutboundMessage<'_>,
    ) -> BoxFuture<'_, Result<Option<ScheduledMarker>, TransportError>> {
        let event_name = message.event_name.to_string();
        let body = message.body.to_vec();
        let delay = message.delay.unwrap_or(Duration::ZERO);
        Box::pin(async move {
            let queue = self.queue_for(&event_name).await?;
            let encoded = String::from_utf8_lossy(&body).into_owned();

            let response = queue
                .put_message(encoded)
                .visibility_timeout(delay)
                .await
                .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

            if delay == Duration::ZERO {
                return Ok(None);
            }

            let message_id = response.message_id.to_string();
            let pop_receipt = response.pop_receipt.to_string();
            Ok(Some(ScheduledMarker::new(format!("{message_id}|{pop_receipt}"))))
        })
    }

    fn cancel_scheduled(
        &self,
        event_name: &str,
        marker: &ScheduledMarker,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let event_name = event_name.to_string();
        let parsed = parse_marker(marker);
        Box::pin(async move {
            let (message_id, pop_receipt) = parsed?;
            let queue = self.queue_for(&event_name).await?;
            queue
                .pop_receipt_client(message_id.clone(), pop_receipt)
                .delete()
                .await
                .map_err(|_| TransportError::CancelNotFound(message_id))?;
            Ok(())
        })
    }

    fn start_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
        _entity_kind: EntityKind,
        serializer: Arc<dyn Serializer>,
        dispatch: ConsumeDispatcher,
        unhandled_error_behavior: UnhandledErrorBehavior,
        readiness: Arc<ReadinessGate>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let event_name = event_name.to_string();
        let consumer_name = consumer_name.to_string();
        Box::pin(async move {
            let queue = self.queue_for(&event_name).await?;
            let dead_letter_queue = self.queue_for(&dead_letter_queue_name(&event_name)).await?;

            let stop = Arc::new(StopSignal::new());
            let task_stop = Arc::clone(&stop);
            let task_event_name = event_name.clone();
            let task_consumer_name = consumer_name.clone();

            let handle = tokio::spawn(async move {
                readiness.wait().await;
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "Queue Storage poll loop started");
                loop {
                    if task_stop.is_stopped() {
                        break;
                    }

                    let received = tokio::select! {
                        () = task_stop.wait() => break,
                        received = queue.get_messages().number_of_messages(8).into_future() => received,
                    };

                    let messages = match received {
                        Ok(response) => response.messages,
                        Err(err) => {
                            error!(error = %err, "Queue Storage poll error");
                            tokio::time::sleep(EMPTY_RESULTS_DELAY).await;
                            continue;
                        }
                    };

                    if messages.is_empty() {
                        tokio::time::sleep(EMPTY_RESULTS_DELAY).await;
                        continue;
                    }

                    for message in messages {
                        let body = message.message_text.clone().into_bytes();
                        let action = dispatch_incoming(
                            serializer.as_ref(),
                            &body,
                            "application/json; charset=utf-8",
                            &dispatch,
                            unhandled_error_behavior,
                        )
                        .await;

                        let pop_client = queue.pop_receipt_client(
                            message.message_id.clone(),
                            message.pop_receipt.clone(),
                        );

                        match action {
                            ConsumeAction::Ack | ConsumeAction::Discard => {
                                if let Err(err) = pop_client.delete().await {
                                    error!(error = %err, "failed to delete Queue Storage message");
                                }
                            }
                            ConsumeAction::DeadLetter => {
                                if let Err(err) = dead_letter_queue.put_message(message.message_text).await {
                                    error!(error = %err, "failed to publish to Queue Storage shadow dead-letter queue");
                                }
                                if let Err(err) = pop_client.delete().await {
                                    error!(error = %err, "failed to delete Queue Storage message after dead-lettering");
                                }
                            }
                            ConsumeAction::Requeue => {
                                // Leave the message alone; it becomes visible
                                // again once its visibility timeout elapses.
                            }
                        }
                    }
                }
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "Queue Storage poll loop stopped");
            });

            self.consumers
                .lock()
                .await
                .insert((event_name, consumer_name), ConsumerTask { stop, handle });
            Ok(())
        })
    }

    fn stop_consuming(
        &self,
        event_name: &str,
        consumer_name: &str,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let key = (event_name.to_string(), consumer_name.to_string());
        Box::pin(async move {
            let task = self.consumers.lock().await.remove(&key);
            if let Some(task) = task {
                task.stop.stop();
                let _ = task.handle.await;
            }
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async {
            azure_identity::DefaultAzureCredential::new()
                .map(|_| ())
                .map_err(|e| TransportError::Unreachable(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_queue_name_appends_suffix() {
        assert_eq!(dead_letter_queue_name("order-placed"), "order-placed-deadletter");
    }

    #[test]
    fn parse_marker_splits_on_pipe() {
        let marker = ScheduledMarker::new("abc123|AgAAAAMAAAA");
        let (id, pop_receipt) = parse_marker(&marker).unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(pop_receipt, "AgAAAAMAAAA");
    }

    #[test]
    fn parse_marker_rejects_missing_separator() {
        let marker = ScheduledMarker::new("no-separator-here");
        assert!(parse_marker(&marker).is_err());
    }

    #[test]
    fn negative_delay_clamps_to_zero_before_publish() {
        // `OutboundMessage::delay` is `Option<Duration>`, which cannot hold a
        // negative value; any `scheduled - now` computation that would have
        // gone negative upstream is already clamped by the time it reaches
        // this transport, so `unwrap_or(Duration::ZERO)` is the only
        // remaining clamp this crate needs to apply.
        let delay: Option<Duration> = None;
        assert_eq!(delay.unwrap_or(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QueueStorageTransport>();
    }
}
