//! Kafka producer announcing filtered files to the transform stage.

use crate::config::KafkaConfig;
use crate::model::TransformRequest;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Value of the `message-type` header on notifications
const TRANSFORM_REQUEST_TYPE: &str = "transform_request";

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Topic the message was delivered to
    pub topic: String,
    /// Partition the message was delivered to
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Topic to send the message to
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    /// Serialized message payload
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    /// Transform request keyed and correlated by its request ID
    pub fn transform_request(
        topic: impl Into<String>,
        request: &TransformRequest,
    ) -> Result<Self, ProducerError> {
        Ok(Self::new_json(topic, request)?
            .with_key(&request.request_id)
            .with_correlation_id(&request.request_id)
            .with_message_type(TRANSFORM_REQUEST_TYPE))
    }

    /// Set the message key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a correlation ID header
    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with_header("correlation-id", id)
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }

    fn kafka_headers(&self) -> OwnedHeaders {
        self.headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value),
                })
            })
    }
}

/// Announces filtered files to downstream consumers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, request: &TransformRequest) -> Result<DeliveryResult, ProducerError>;
}

/// Kafka-backed [`NotificationPublisher`]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create a new publisher writing to the configured producer topic
    pub fn new(config: &KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            servers = %config.bootstrap_servers,
            topic = %config.producer_topic,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = producer_config(config)
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self {
            producer,
            topic: config.producer_topic.clone(),
            timeout: config.message_timeout(),
        })
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(message.kafka_headers());

        if let Some(ref k) = message.key {
            record = record.key(k);
        }

        debug!(
            size_bytes = message.payload.len(),
            "Sending message"
        );

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl NotificationPublisher for KafkaPublisher {
    async fn publish(&self, request: &TransformRequest) -> Result<DeliveryResult, ProducerError> {
        let message = OutgoingMessage::transform_request(&self.topic, request)?;
        self.send(message).await
    }
}

impl Drop for KafkaPublisher {
    fn drop(&mut self) {
        info!("Shutting down Kafka producer");
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

/// rdkafka producer settings: wait for all replicas, bounded retries
fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = config.client_config();

    client_config
        .set("acks", "all")
        .set("retries", config.producer_retries.to_string())
        .set("message.timeout.ms", config.message_timeout_ms.to_string());

    client_config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::ObjectLocation;

    fn transform_request() -> TransformRequest {
        TransformRequest::new(
            "req-1",
            ObjectLocation::parse("s3://filter-bucket/file.csv").unwrap(),
            ObjectLocation::parse("s3://out/folder/file.csv").unwrap(),
        )
    }

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            consumer_group: "filter-request".to_string(),
            consumer_topic: "filter-request".to_string(),
            producer_topic: "transform-request".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: Some("user".to_string()),
            sasl_password: Some("secret".to_string()),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            producer_retries: 5,
            message_timeout_ms: 30000,
        }
    }

    #[test]
    fn test_outgoing_message_builder() {
        let message = OutgoingMessage {
            topic: "test".to_string(),
            key: None,
            payload: vec![1, 2, 3],
            headers: vec![],
        }
        .with_key("my-key")
        .with_header("header1", "value1")
        .with_correlation_id("corr-123");

        assert_eq!(message.key, Some("my-key".to_string()));
        assert_eq!(message.headers.len(), 2);
    }

    #[test]
    fn test_transform_request_message() {
        let message = OutgoingMessage::transform_request("transform-request", &transform_request()).unwrap();

        assert_eq!(message.topic, "transform-request");
        assert_eq!(message.key.as_deref(), Some("req-1"));
        assert!(message
            .headers
            .contains(&("correlation-id".to_string(), "req-1".to_string())));
        assert!(message
            .headers
            .contains(&("message-type".to_string(), TRANSFORM_REQUEST_TYPE.to_string())));

        let payload: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(payload["inputUrl"], "s3://filter-bucket/file.csv");
        assert_eq!(payload["outputUrl"], "s3://out/folder/file.csv");
    }

    #[test]
    fn test_producer_config_build() {
        let client_config = producer_config(&kafka_config());

        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get("acks"), Some("all"));
        assert_eq!(client_config.get("retries"), Some("5"));
        assert_eq!(client_config.get("sasl.username"), Some("user"));
        assert_eq!(client_config.get("security.protocol"), Some("SASL_PLAINTEXT"));
    }
}
