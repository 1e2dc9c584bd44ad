//! Azure Event Hubs transport for relaybus.
//!
//! Entity model: a partitioned stream per event, with consumer offsets
//! tracked in a blob-backed checkpoint store (`azure_storage_blobs`) rather
//! than in this process — the same checkpoint container can be shared by
//! every instance of a consumer group. Event Hubs has no on-demand
//! provisioning (the hub is assumed to exist), no scheduled publish, and no
//! cancel; a failed dispatch is "dead-lettered" by republishing the raw
//! envelope to a shadow hub named `<event-name>-deadletter`, since Event
//! Hubs itself has no dead-letter primitive.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use azure_identity::DefaultAzureCredential;
use azure_messaging_eventhubs::{
    EventData, EventHubConsumerClient, EventHubConsumerClientOptions, EventHubProducerClient,
    EventHubProducerClientOptions, EventPosition,
};
use azure_storage_blobs::prelude::{BlobServiceClient, ContainerClient};
use relaybus_core::context::Headers;
use relaybus_core::registry::{ConsumeDispatcher, EntityKind, UnhandledErrorBehavior};
use relaybus_core::serializer::Serializer;
use relaybus_core::transport::{
    BoxFuture, BrokerOps, ConsumeAction, OutboundMessage, ReadinessGate, ScheduledMarker,
    StopSignal, TransportError, dispatch_incoming,
};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

const DEAD_LETTER_SUFFIX: &str = "-deadletter";

fn dead_letter_hub_name(event_name: &str) -> String {
    format!("{event_name}{DEAD_LETTER_SUFFIX}")
}

struct ConsumerTask {
    stop: Arc<StopSignal>,
    handle: tokio::task::JoinHandle<()>,
}

/// Azure Event Hubs-backed [`BrokerOps`] implementation.
pub struct EventHubsTransport {
    fully_qualified_namespace: String,
    consumer_group: String,
    checkpoint_container: ContainerClient,
    producers: AsyncMutex<HashMap<String, Arc<EventHubProducerClient>>>,
    consumers: AsyncMutex<HashMap<(String, String), ConsumerTask>>,
}

impl EventHubsTransport {
    /// Start building a transport against `<namespace>.servicebus.windows.net`,
    /// checkpointing to `checkpoint_container` in `storage_account_url`.
    #[must_use]
    pub fn builder(
        fully_qualified_namespace: impl Into<String>,
        storage_account_url: impl Into<String>,
        checkpoint_container: impl Into<String>,
    ) -> EventHubsTransportBuilder {
        EventHubsTransportBuilder {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            storage_account_url: storage_account_url.into(),
            checkpoint_container: checkpoint_container.into(),
            consumer_group: "$Default".to_string(),
        }
    }

    async fn producer_for(&self, hub_name: &str) -> Result<Arc<EventHubProducerClient>, TransportError> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(hub_name) {
            return Ok(Arc::clone(producer));
        }
        info!(namespace = %self.fully_qualified_namespace, hub = %hub_name, "connecting Event Hubs producer");
        let credential = DefaultAzureCredential::new()
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let producer = EventHubProducerClient::new(
            self.fully_qualified_namespace.clone(),
            hub_name.to_string(),
            Arc::new(credential),
            EventHubProducerClientOptions::default(),
        )
        .await
        .map_err(|e| TransportError::Unreachable(e.to_string()))?;
        let producer = Arc::new(producer);
        producers.insert(hub_name.to_string(), Arc::clone(&producer));
        Ok(producer)
    }

    fn headers_to_properties(headers: &Headers) -> HashMap<String, String> {
        headers.clone()
    }
}

/// Builder for [`EventHubsTransport`].
pub struct EventHubsTransportBuilder {
    fully_qualified_namespace: String,
    storage_account_url: String,
    checkpoint_container: String,
    consumer_group: String,
}

impl EventHubsTransportBuilder {
    /// Override the consumer group every receiver reads from. Defaults to
    /// `"$Default"`.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    /// Build the transport. Does not connect eagerly.
    #[must_use]
    pub fn build(self) -> EventHubsTransport {
        let service_client = BlobServiceClient::new(
            self.storage_account_url,
            azure_storage_blobs::prelude::StorageCredentials::anonymous(),
        );
        let checkpoint_container = service_client.container_client(self.checkpoint_container);
        EventHubsTransport {
            fully_qualified_namespace: self.fully_qualified_namespace,
            consumer_group: self.consumer_group,
            checkpoint_container,
            producers: AsyncMutex::new(HashMap::new()),
            consumers: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl BrokerOps for EventHubsTransport {
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
        let body = message.body.to_vec();
        let content_type = message.content_type.as_str().to_string();
        let properties = Self::headers_to_properties(message.headers);
        let delay = message.delay;

        Box::pin(async move {
            if delay.is_some() {
                warn!(event_name = %event_name, "scheduled publish is not supported by Event Hubs, publishing immediately");
            }

            let producer = self.producer_for(&event_name).await?;
            let mut event = EventData::from(body);
            event.set_content_type(content_type);
            for (key, value) in properties {
                event.set_property(key, value);
            }

            producer
                .send_event(event)
                .await
                .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
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
                "Event Hubs has no primitive to cancel a publish".to_string(),
            ))
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
            let credential = DefaultAzureCredential::new()
                .map_err(|e| TransportError::Unreachable(e.to_string()))?;
            let consumer_client = EventHubConsumerClient::new(
                self.fully_qualified_namespace.clone(),
                event_name.clone(),
                self.consumer_group.clone(),
                Arc::new(credential),
                EventHubConsumerClientOptions::default(),
            )
            .await
            .map_err(|e| TransportError::ConsumeLoop(e.to_string()))?;

            let dead_letter_producer = self.producer_for(&dead_letter_hub_name(&event_name)).await?;
            let checkpoint_container = self.checkpoint_container.clone();

            let stop = Arc::new(StopSignal::new());
            let task_stop = Arc::clone(&stop);
            let task_event_name = event_name.clone();
            let task_consumer_name = consumer_name.clone();

            let handle = tokio::spawn(async move {
                readiness.wait().await;
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "Event Hubs receive loop started");
                let mut stream = consumer_client.receive_events(
                    EventPosition::from_checkpoint_store(checkpoint_container.clone()),
                );
                loop {
                    tokio::select! {
                        () = task_stop.wait() => break,
                        next = stream.next_event() => {
                            let Some(received) = next else { break };
                            let received = match received {
                                Ok(received) => received,
                                Err(err) => {
                                    error!(error = %err, "Event Hubs receive error");
                                    continue;
                                }
                            };

                            let content_type = received
                                .content_type()
                                .map(ToString::to_string)
                                .unwrap_or_else(|| "application/json; charset=utf-8".to_string());

                            let action = dispatch_incoming(
                                serializer.as_ref(),
                                received.body(),
                                &content_type,
                                &dispatch,
                                unhandled_error_behavior,
                            )
                            .await;

                            if action == ConsumeAction::DeadLetter {
                                let mut shadow = EventData::from(received.body().to_vec());
                                shadow.set_content_type(content_type.clone());
                                if let Err(err) = dead_letter_producer.send_event(shadow).await {
                                    error!(error = %err, "failed to publish to Event Hubs shadow dead-letter hub");
                                }
                            }

                            if let Err(err) = stream.checkpoint(&received).await {
                                error!(error = %err, "failed to checkpoint Event Hubs offset");
                            }
                        }
                    }
                }
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "Event Hubs receive loop stopped");
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
            DefaultAzureCredential::new()
                .map(|_| ())
                .map_err(|e| TransportError::Unreachable(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_hub_name_appends_suffix() {
        assert_eq!(dead_letter_hub_name("order-placed"), "order-placed-deadletter");
    }

    #[test]
    fn transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EventHubsTransport>();
    }

    #[test]
    fn builder_defaults_consumer_group() {
        let transport = EventHubsTransport::builder(
            "contoso.servicebus.windows.net",
            "https://contosostorage.blob.core.windows.net",
            "checkpoints",
        )
        .build();
        assert_eq!(transport.consumer_group, "$Default");
    }

    #[test]
    fn builder_honors_consumer_group_override() {
        let transport = EventHubsTransport::builder(
            "contoso.servicebus.windows.net",
            "https://contosostorage.blob.core.windows.net",
            "checkpoints",
        )
        .consumer_group("billing-group")
        .build();
        assert_eq!(transport.consumer_group, "billing-group");
    }
}
