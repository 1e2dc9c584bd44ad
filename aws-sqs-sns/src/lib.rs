//! Amazon SNS/SQS transport for relaybus.
//!
//! Entity model: an SNS topic per event, fanning out into one SQS queue per
//! consumer subscribed to it. Neither service has a native scheduled-publish
//! or cancel primitive; a failed dispatch is "dead-lettered" by republishing
//! to a shadow queue named `<event-name>-deadletter`, the same convention
//! Queue Storage uses, since SNS/SQS dead-letter handling is marked TODO in
//! the upstream source this spec was distilled from.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_sns::types::MessageAttributeValue as SnsMessageAttributeValue;
use relaybus_core::context::Headers;
use relaybus_core::registry::{ConsumeDispatcher, EntityKind, UnhandledErrorBehavior};
use relaybus_core::serializer::Serializer;
use relaybus_core::transport::{
    BoxFuture, BrokerOps, ConsumeAction, OutboundMessage, ReadinessGate, ScheduledMarker,
    StopSignal, TransportError, dispatch_incoming,
};
use relaybus_runtime::cache::ClientCache;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

const DEAD_LETTER_SUFFIX: &str = "-deadletter";

fn dead_letter_queue_name(event_name: &str) -> String {
    format!("{event_name}{DEAD_LETTER_SUFFIX}")
}

struct ConsumerTask {
    stop: Arc<StopSignal>,
    handle: tokio::task::JoinHandle<()>,
}

/// Amazon SNS/SQS-backed [`BrokerOps`] implementation.
pub struct SqsSnsTransport {
    sns: ClientCache<Arc<aws_sdk_sns::Client>>,
    sqs: ClientCache<Arc<aws_sdk_sqs::Client>>,
    topic_arns: AsyncMutex<HashMap<String, String>>,
    queue_urls: AsyncMutex<HashMap<String, String>>,
    consumers: AsyncMutex<HashMap<(String, String), ConsumerTask>>,
}

impl SqsSnsTransport {
    /// Start building a transport using the default AWS credential chain
    /// (environment, profile, IMDS, in that order).
    #[must_use]
    pub fn builder() -> SqsSnsTransportBuilder {
        SqsSnsTransportBuilder::default()
    }

    async fn sns_client(&self) -> Result<Arc<aws_sdk_sns::Client>, TransportError> {
        self.sns
            .get_or_init(|| async {
                let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                Ok::<_, TransportError>(Arc::new(aws_sdk_sns::Client::new(&config)))
            })
            .await
    }

    async fn sqs_client(&self) -> Result<Arc<aws_sdk_sqs::Client>, TransportError> {
        self.sqs
            .get_or_init(|| async {
                let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                Ok::<_, TransportError>(Arc::new(aws_sdk_sqs::Client::new(&config)))
            })
            .await
    }

    async fn topic_arn_for(&self, event_name: &str) -> Result<String, TransportError> {
        if let Some(arn) = self.topic_arns.lock().await.get(event_name) {
            return Ok(arn.clone());
        }
        let sns = self.sns_client().await?;
        let output = sns
            .create_topic()
            .name(event_name)
            .send()
            .await
            .map_err(|e| TransportError::ProvisioningFailed {
                entity: event_name.to_string(),
                reason: e.to_string(),
            })?;
        let arn = output
            .topic_arn()
            .ok_or_else(|| TransportError::ProvisioningFailed {
                entity: event_name.to_string(),
                reason: "create_topic returned no ARN".to_string(),
            })?
            .to_string();
        self.topic_arns.lock().await.insert(event_name.to_string(), arn.clone());
        Ok(arn)
    }

    async fn queue_url_for(&self, queue_name: &str) -> Result<String, TransportError> {
        if let Some(url) = self.queue_urls.lock().await.get(queue_name) {
            return Ok(url.clone());
        }
        let sqs = self.sqs_client().await?;
        let output = sqs
            .create_queue()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| TransportError::ProvisioningFailed {
                entity: queue_name.to_string(),
                reason: e.to_string(),
            })?;
        let url = output
            .queue_url()
            .ok_or_else(|| TransportError::ProvisioningFailed {
                entity: queue_name.to_string(),
                reason: "create_queue returned no URL".to_string(),
            })?
            .to_string();
        self.queue_urls.lock().await.insert(queue_name.to_string(), url.clone());
        Ok(url)
    }

    async fn queue_arn_for(&self, queue_url: &str) -> Result<String, TransportError> {
        let sqs = self.sqs_client().await?;
        let output = sqs
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| TransportError::ProvisioningFailed {
                entity: queue_url.to_string(),
                reason: e.to_string(),
            })?;
        output
            .attributes()
            .and_then(|attrs| attrs.get(&aws_sdk_sqs::types::QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| TransportError::ProvisioningFailed {
                entity: queue_url.to_string(),
                reason: "queue has no ARN attribute".to_string(),
            })
    }

    fn headers_to_sns_attributes(headers: &Headers) -> HashMap<String, SnsMessageAttributeValue> {
        headers
            .iter()
            .filter_map(|(key, value)| {
                SnsMessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .ok()
                    .map(|attr| (key.clone(), attr))
            })
            .collect()
    }
}

/// Builder for [`SqsSnsTransport`].
#[derive(Default)]
pub struct SqsSnsTransportBuilder;

impl SqsSnsTransportBuilder {
    /// Build the transport. Does not connect eagerly.
    #[must_use]
    pub fn build(self) -> SqsSnsTransport {
        SqsSnsTransport {
            sns: ClientCache::new(),
            sqs: ClientCache::new(),
            topic_arns: AsyncMutex::new(HashMap::new()),
            queue_urls: AsyncMutex::new(HashMap::new()),
            consumers: AsyncMutex::new(HashMap::new()),
        }
    }
}

impl BrokerOps for SqsSnsTransport {
    fn provision_entity(
        &self,
        event_name: &str,
        _entity_kind: EntityKind,
        consumer_name: Option<&str>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let event_name = event_name.to_string();
        let consumer_name = consumer_name.map(str::to_string);
        Box::pin(async move {
            let topic_arn = self.topic_arn_for(&event_name).await?;

            if let Some(consumer_name) = consumer_name {
                let queue_url = self.queue_url_for(&consumer_name).await?;
                let queue_arn = self.queue_arn_for(&queue_url).await?;
                let sns = self.sns_client().await?;
                sns.subscribe()
                    .topic_arn(&topic_arn)
                    .protocol("sqs")
                    .endpoint(&queue_arn)
                    .send()
                    .await
                    .map_err(|e| TransportError::ProvisioningFailed {
                        entity: format!("{event_name}->{consumer_name}"),
                        reason: e.to_string(),
                    })?;

                self.queue_url_for(&dead_letter_queue_name(&event_name)).await?;
            }
            Ok(())
        })
    }

    fn publish(
        &self,
        message: OutboundMessage<'_>,
    ) -> BoxFuture<'_, Result<Option<ScheduledMarker>, TransportError>> {
        let event_name = message.event_name.to_string();
        let body = String::from_utf8_lossy(message.body).into_owned();
        let attributes = Self::headers_to_sns_attributes(message.headers);
        let delay = message.delay;

        Box::pin(async move {
            if delay.is_some() {
                warn!(event_name = %event_name, "scheduled publish is not supported by SNS/SQS, publishing immediately");
            }

            let topic_arn = self.topic_arn_for(&event_name).await?;
            let sns = self.sns_client().await?;
            sns.publish()
                .topic_arn(topic_arn)
                .message(body)
                .set_message_attributes(Some(attributes))
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
                "SNS/SQS has no primitive to cancel a publish".to_string(),
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
            let sqs = self.sqs_client().await?;
            let queue_url = self.queue_url_for(&consumer_name).await?;
            let dead_letter_queue_url = self.queue_url_for(&dead_letter_queue_name(&event_name)).await?;

            let stop = Arc::new(StopSignal::new());
            let task_stop = Arc::clone(&stop);
            let task_event_name = event_name.clone();
            let task_consumer_name = consumer_name.clone();

            let handle = tokio::spawn(async move {
                readiness.wait().await;
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "SQS poll loop started");
                loop {
                    let received = tokio::select! {
                        () = task_stop.wait() => break,
                        received = sqs
                            .receive_message()
                            .queue_url(&queue_url)
                            .max_number_of_messages(10)
                            .wait_time_seconds(20)
                            .send() => received,
                    };

                    let messages = match received {
                        Ok(output) => output.messages.unwrap_or_default(),
                        Err(err) => {
                            error!(error = %err, "SQS receive error");
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                            continue;
                        }
                    };

                    for message in messages {
                        let Some(body) = message.body() else { continue };
                        let Some(receipt_handle) = message.receipt_handle() else { continue };

                        let action = dispatch_incoming(
                            serializer.as_ref(),
                            body.as_bytes(),
                            "application/json; charset=utf-8",
                            &dispatch,
                            unhandled_error_behavior,
                        )
                        .await;

                        match action {
                            ConsumeAction::Ack | ConsumeAction::Discard => {
                                if let Err(err) = sqs
                                    .delete_message()
                                    .queue_url(&queue_url)
                                    .receipt_handle(receipt_handle)
                                    .send()
                                    .await
                                {
                                    error!(error = %err, "failed to delete SQS message");
                                }
                            }
                            ConsumeAction::DeadLetter => {
                                if let Err(err) = sqs
                                    .send_message()
                                    .queue_url(&dead_letter_queue_url)
                                    .message_body(body)
                                    .send()
                                    .await
                                {
                                    error!(error = %err, "failed to publish to SQS shadow dead-letter queue");
                                }
                                if let Err(err) = sqs
                                    .delete_message()
                                    .queue_url(&queue_url)
                                    .receipt_handle(receipt_handle)
                                    .send()
                                    .await
                                {
                                    error!(error = %err, "failed to delete SQS message after dead-lettering");
                                }
                            }
                            ConsumeAction::Requeue => {
                                // Leave the message alone; it reappears once
                                // its visibility timeout elapses.
                            }
                        }
                    }
                }
                debug!(event_name = %task_event_name, consumer_name = %task_consumer_name, "SQS poll loop stopped");
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
        Box::pin(async { self.sqs_client().await.map(|_| ()) })
    }
}
