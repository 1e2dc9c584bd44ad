//! Amazon Kinesis transport for relaybus.
//!
//! Publish-only in the sense §4.F describes: Kinesis has no dead-letter
//! concept in this core (a failed dispatch is simply requeued by not
//! advancing past the record, per [`relaybus_core::transport::ConsumeAction::Requeue`]),
//! no on-demand stream provisioning (the stream is assumed to exist), and no
//! scheduled-publish or cancel primitive. The partition key defaults to the
//! event id (`context.id`, carried over [`relaybus_core::context::HEADER_ID`]);
//! callers that need ordered delivery across a logical key can override this
//! via [`KinesisTransportBuilder::partition_key_selector`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::ShardIteratorType;
use relaybus_core::context::HEADER_ID;
use relaybus_core::registry::{ConsumeDispatcher, EntityKind, UnhandledErrorBehavior};
use relaybus_core::serializer::Serializer;
use relaybus_core::transport::{
    BoxFuture, BrokerOps, ConsumeAction, OutboundMessage, ReadinessGate, ScheduledMarker,
    StopSignal, TransportError, dispatch_incoming,
};
use relaybus_runtime::cache::ClientCache;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

const SHARD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A caller-supplied override for the Kinesis partition key, given the
/// outbound event name and headers.
pub type PartitionKeySelector =
    Arc<dyn Fn(&str, &HashMap<String, String>) -> String + Send + Sync>;

struct ConsumerTask {
    stop: Arc<StopSignal>,
    handle: tokio::task::JoinHandle<()>,
}

/// Amazon Kinesis-backed [`BrokerOps`] implementation.
pub struct KinesisTransport {
    client: ClientCache<Arc<aws_sdk_kinesis::Client>>,
    partition_key_selector: Option<PartitionKeySelector>,
    consumers: AsyncMutex<HashMap<(String, String), ConsumerTask>>,
}

impl KinesisTransport {
    /// Start building a transport using the default AWS credential chain.
    #[must_use]
    pub fn builder() -> KinesisTransportBuilder {
        KinesisTransportBuilder::default()
    }

    async fn client(&self) -> Result<Arc<aws_sdk_kinesis::Client>, TransportError> {
        self.client
            .get_or_init(|| async {
                let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                Ok::<_, TransportError>(Arc::new(aws_sdk_kinesis::Client::new(&config)))
            })
            .await
    }

    fn partition_key_for(&self, event_name: &str, headers: &HashMap<String, String>) -> String {
        if let Some(selector) = &self.partition_key_selector {
            return selector(event_name, headers);
        }
        headers
            .get(HEADER_ID)
            .cloned()
            .unwrap_or_else(|| event_name.to_string())
    }
}

/// Builder for [`KinesisTransport`].
#[derive(Default)]
pub struct KinesisTransportBuilder {
    partition_key_selector: Option<PartitionKeySelector>,
}

impl KinesisTransportBuilder {
    /// Override how the partition key is derived from the outbound event
    /// name and headers. Defaults to the event id
    /// ([`relaybus_core::context::HEADER_ID`]); callers needing ordered
    /// delivery across a logical grouping key (e.g. a tenant or aggregate
    /// id) should supply one here rather than depend on event-id ordering.
    #[must_use]
    pub fn partition_key_selector(mut self, selector: PartitionKeySelector) -> Self {
        self.partition_key_selector = Some(selector);
        self
    }

    /// Build the transport. Does not connect eagerly.
    #[must_use]
    pub fn build(self) -> KinesisTransport {
        KinesisTransport {
            client: ClientCache::new(),
            partition_key_selector: self.partition_key_selector,
            consumers: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl BrokerOps for KinesisTransport {
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
        let headers = message.headers.clone();
        let delay = message.delay;

        Box::pin(async move {
            if delay.is_some() {
                warn!(event_name = %event_name, "scheduled publish is not supported by Kinesis, publishing immediately");
            }

            let client = self.client().await?;
            let partition_key = self.partition_key_for(&event_name, &headers);

            client
                .put_record()
                .stream_name(&event_name)
                .partition_key(partition_key)
                .data(Blob::new(body))
                .send()
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
                "Kinesis has no primitive to cancel a publish".to_string(),
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
            let client = self.client().await?;
            let shards = client
                .list_shards()
                .stream_name(&event_name)
                .send()
                .await
                .map_err(|e| TransportError::ConsumeLoop(e.to_string()))?
                .shards
                .unwrap_or_default();

            let stop = Arc::new(StopSignal::new());
            let task_event_name = event_name.clone();
            let task_consumer_name = consumer_name.clone();
            let task_stop = Arc::clone(&stop);

            let handle = tokio::spawn(async move {
                readiness.wait().await;
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, shard_count = shards.len(), "Kinesis receive loop started");

                let mut shard_handles = Vec::with_capacity(shards.len());
                for shard in shards {
                    let Some(shard_id) = shard.shard_id else { continue };
                    let client = client.clone();
                    let stream_name = task_event_name.clone();
                    let serializer = Arc::clone(&serializer);
                    let dispatch = dispatch.clone();
                    let stop = Arc::clone(&task_stop);

                    shard_handles.push(tokio::spawn(async move {
                        let iterator = client
                            .get_shard_iterator()
                            .stream_name(&stream_name)
                            .shard_id(&shard_id)
                            .shard_iterator_type(ShardIteratorType::Latest)
                            .send()
                            .await
                            .ok()
                            .and_then(|output| output.shard_iterator);

                        let Some(mut shard_iterator) = iterator else {
                            error!(shard_id, "failed to obtain Kinesis shard iterator");
                            return;
                        };

                        loop {
                            if stop.is_stopped() {
                                break;
                            }

                            let output = match client.get_records().shard_iterator(&shard_iterator).send().await {
                                Ok(output) => output,
                                Err(err) => {
                                    error!(error = %err, shard_id, "Kinesis get_records error");
                                    tokio::time::sleep(SHARD_POLL_INTERVAL).await;
                                    continue;
                                }
                            };

                            for record in output.records {
                                let action = dispatch_incoming(
                                    serializer.as_ref(),
                                    record.data.as_ref(),
                                    "application/json; charset=utf-8",
                                    &dispatch,
                                    unhandled_error_behavior,
                                )
                                .await;

                                if action == ConsumeAction::Requeue {
                                    warn!(shard_id, "Kinesis has no redelivery primitive; record is skipped after a failed dispatch");
                                }
                            }

                            let Some(next_iterator) = output.next_shard_iterator else {
                                break;
                            };
                            shard_iterator = next_iterator;
                            tokio::time::sleep(SHARD_POLL_INTERVAL).await;
                        }
                    }));
                }

                for handle in shard_handles {
                    let _ = handle.await;
                }
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "Kinesis receive loop stopped");
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
        Box::pin(async { self.client().await.map(|_| ()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_partition_key_falls_back_to_event_id_header() {
        let transport = KinesisTransport::builder().build();
        let mut headers = HashMap::new();
        headers.insert(HEADER_ID.to_string(), "event-id-123".to_string());
        assert_eq!(transport.partition_key_for("order-placed", &headers), "event-id-123");
    }

    #[test]
    fn default_partition_key_falls_back_to_event_name_when_id_absent() {
        let transport = KinesisTransport::builder().build();
        let headers = HashMap::new();
        assert_eq!(transport.partition_key_for("order-placed", &headers), "order-placed");
    }

    #[test]
    fn custom_partition_key_selector_overrides_the_default() {
        let transport = KinesisTransport::builder()
            .partition_key_selector(Arc::new(|_event_name, headers| {
                headers.get("TenantId").cloned().unwrap_or_default()
            }))
            .build();
        let mut headers = HashMap::new();
        headers.insert("TenantId".to_string(), "tenant-42".to_string());
        assert_eq!(transport.partition_key_for("order-placed", &headers), "tenant-42");
    }

    #[test]
    fn transport_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KinesisTransport>();
    }

    #[tokio::test]
    async fn cancel_scheduled_is_always_unsupported() {
        let transport = KinesisTransport::builder().build();
        let err = transport
            .cancel_scheduled("order-placed", &ScheduledMarker::new("n/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(_)));
    }
}
