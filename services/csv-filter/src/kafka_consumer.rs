use crate::config::KafkaConfig;
use crate::model::FilterRequest;
use crate::service::FilterService;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What happened to a single consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pipeline completed
    Completed,
    /// The request decoded but the pipeline failed
    Failed,
    /// The payload was missing or not a filter request
    Dropped,
}

/// Decode a payload and run it through the pipeline.
///
/// Failures end here; the message is never redelivered.
pub async fn dispatch(service: &FilterService, payload: Option<&[u8]>) -> DispatchOutcome {
    let Some(payload) = payload else {
        warn!("Dropping message without payload");
        return DispatchOutcome::Dropped;
    };

    let request: FilterRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            error!(
                error = %e,
                size_bytes = payload.len(),
                "Failed to decode filter request, dropping message"
            );
            return DispatchOutcome::Dropped;
        }
    };

    debug!(request = %request, "Received filter request");

    match service.handle(&request).await {
        Ok(_) => DispatchOutcome::Completed,
        Err(_) => DispatchOutcome::Failed,
    }
}

/// Kafka consumer feeding filter requests to the pipeline one at a time
pub struct FilterRequestConsumer {
    consumer: StreamConsumer,
    service: Arc<FilterService>,
}

impl FilterRequestConsumer {
    /// Create a consumer subscribed to the filter request topic
    pub fn new(config: &KafkaConfig, service: Arc<FilterService>) -> Result<Self> {
        let consumer: StreamConsumer = consumer_config(config)
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.consumer_topic])
            .context("Failed to subscribe to filter request topic")?;

        info!(
            topic = %config.consumer_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self { consumer, service })
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// A message is fully handled and committed before the next one is read.
    /// Cancellation is only observed between messages.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting filter request consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    self.process_message(&message).await;

                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("csv_filter.kafka.errors").increment(1);
                }
            }
        }

        info!("Filter request consumer stopped");

        Ok(())
    }

    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>) {
        match dispatch(&self.service, message.payload()).await {
            DispatchOutcome::Dropped => {
                metrics::counter!("csv_filter.messages.dropped").increment(1);
            }
            DispatchOutcome::Completed | DispatchOutcome::Failed => {
                metrics::counter!("csv_filter.messages.processed").increment(1);
            }
        }
    }
}

/// Manual commits after each message, no auto-commit
fn consumer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = config.client_config();

    client_config
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", &config.auto_offset_reset)
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

    client_config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::DimensionProcessor;
    use crate::producer::{DeliveryResult, MockNotificationPublisher};
    use crate::service::FilterSettings;
    use crate::storage::testing::MemoryStore;

    fn service(store: MemoryStore, publishes: usize) -> FilterService {
        let mut publisher = MockNotificationPublisher::new();
        publisher.expect_publish().times(publishes).returning(|_| {
            Ok(DeliveryResult {
                topic: "transform-request".to_string(),
                partition: 0,
                offset: 0,
            })
        });

        FilterService::new(
            Arc::new(store),
            Arc::new(DimensionProcessor::new()),
            Arc::new(publisher),
            FilterSettings {
                file_extension: "csv".to_string(),
                intermediate_bucket: "filter-bucket".to_string(),
                scratch_dir: std::env::temp_dir(),
            },
        )
    }

    #[tokio::test]
    async fn test_dispatch_completes_valid_request() {
        let service = service(
            MemoryStore::new().with_object("s3://bucket/in.csv", "a,b\n"),
            1,
        );
        let payload = br#"{"requestId": "k1", "inputUrl": "s3://bucket/in.csv", "outputUrl": "s3://bucket/out.csv"}"#;

        assert_eq!(
            dispatch(&service, Some(payload.as_slice())).await,
            DispatchOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_dispatch_drops_undecodable_payload() {
        let service = service(MemoryStore::new(), 0);

        assert_eq!(
            dispatch(&service, Some(b"{\"inputUrl\": 42".as_slice())).await,
            DispatchOutcome::Dropped
        );
        assert_eq!(dispatch(&service, None).await, DispatchOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_dispatch_reports_pipeline_failure() {
        let service = service(MemoryStore::new().failing_fetch("NoSuchBucket"), 0);
        let payload = br#"{"inputUrl": "s3://bucket/in.csv", "outputUrl": "s3://bucket/out.csv"}"#;

        assert_eq!(
            dispatch(&service, Some(payload.as_slice())).await,
            DispatchOutcome::Failed
        );
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let config = KafkaConfig {
            bootstrap_servers: "broker:9092".to_string(),
            consumer_group: "filter-request".to_string(),
            consumer_topic: "filter-request".to_string(),
            producer_topic: "transform-request".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            producer_retries: 5,
            message_timeout_ms: 30000,
        };

        let client_config = consumer_config(&config);
        assert_eq!(client_config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client_config.get("group.id"), Some("filter-request"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
    }
}
