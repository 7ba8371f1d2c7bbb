//! Kafka producer for the camtrack pipeline.
//!
//! Used by the consumer to park poison messages on the dead-letter topic and by
//! the `detection-publisher` binary to feed detection messages onto the queue.

use crate::config::KafkaConfig;
use crate::consumer::IncomingMessage;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the unique message identifier
pub const MESSAGE_ID_HEADER: &str = "message-id";

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

/// Where a message landed
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// A record waiting to be produced
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partitioning key; camera ids keep one camera on one partition
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn new_json<T: Serialize>(topic: impl Into<String>, body: &T) -> Result<Self, ProducerError> {
        serde_json::to_vec(body)
            .map(|payload| Self::new(topic, payload))
            .map_err(|e| ProducerError::SerializationError(e.to_string()))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_message_id(self, id: impl Into<String>) -> Self {
        self.with_header(MESSAGE_ID_HEADER, id)
    }

    fn kafka_headers(&self) -> Option<OwnedHeaders> {
        if self.headers.is_empty() {
            return None;
        }
        let mut headers = OwnedHeaders::new_with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            headers = headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }
        Some(headers)
    }
}

/// Body of a dead-letter record; the original payload travels base64-encoded
/// so undecodable bytes survive intact
#[derive(Debug, Serialize)]
struct DeadLetter<'a> {
    original_topic: &'a str,
    original_partition: i32,
    original_offset: i64,
    original_message_base64: String,
    attempts: u32,
    error: &'a str,
    timestamp: DateTime<Utc>,
}

pub struct QueueProducer {
    producer: FutureProducer,
    config: Arc<KafkaConfig>,
    send_timeout: Duration,
}

impl QueueProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        info!(brokers = %config.bootstrap_servers, "Kafka producer created");

        Ok(Self {
            producer,
            send_timeout: config.request_timeout(),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for the broker's acknowledgment
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let mut record = FutureRecord::to(&message.topic).payload(&message.payload);
        if let Some(key) = &message.key {
            record = record.key(key);
        }
        if let Some(headers) = message.kafka_headers() {
            record = record.headers(headers);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: message.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(
            partition = partition,
            offset = offset,
            bytes = message.payload.len(),
            "Message delivered"
        );

        Ok(DeliveryResult {
            topic: message.topic,
            partition,
            offset,
            key: message.key,
        })
    }

    /// Send a detection payload keyed by camera
    pub async fn send_detection(
        &self,
        camera_id: &str,
        message_id: &str,
        payload: Vec<u8>,
    ) -> Result<DeliveryResult, ProducerError> {
        let message = OutgoingMessage::new(&self.config.topics.detections, payload)
            .with_key(camera_id)
            .with_message_id(message_id);
        self.send(message).await
    }

    /// Park a message that exhausted its redeliveries on the dead-letter topic
    pub async fn send_to_dlq(
        &self,
        original: &IncomingMessage,
        attempts: u32,
        error: &str,
    ) -> Result<DeliveryResult, ProducerError> {
        let meta = &original.metadata;
        let body = DeadLetter {
            original_topic: &meta.topic,
            original_partition: meta.partition,
            original_offset: meta.offset,
            original_message_base64: STANDARD.encode(&original.payload),
            attempts,
            error,
            timestamp: Utc::now(),
        };

        let key = original
            .key_str()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut message = OutgoingMessage::new_json(&self.config.topics.dead_letter_queue, &body)?
            .with_key(key)
            .with_header("original-topic", meta.topic.as_str())
            .with_header("error-reason", error);
        if let Some(id) = original.message_id() {
            message = message.with_message_id(id);
        }

        self.send(message).await
    }

    /// Block until queued messages are delivered or `timeout` passes
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_is_carried_as_header() {
        let message = OutgoingMessage::new("test", vec![1, 2, 3])
            .with_key("cam-1")
            .with_header("origin", "node-4")
            .with_message_id("msg-123");

        assert_eq!(message.key.as_deref(), Some("cam-1"));
        assert_eq!(
            message.headers.last(),
            Some(&(MESSAGE_ID_HEADER.to_string(), "msg-123".to_string()))
        );
        assert!(message.kafka_headers().is_some());
    }

    #[test]
    fn test_dead_letter_body_keeps_raw_payload() {
        let body = DeadLetter {
            original_topic: "camtrack.detections",
            original_partition: 2,
            original_offset: 41,
            original_message_base64: STANDARD.encode([0xffu8, 0x00]),
            attempts: 6,
            error: "lane unavailable",
            timestamp: Utc::now(),
        };
        let message = OutgoingMessage::new_json("dlq", &body).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();

        assert_eq!(json["original_offset"], 41);
        assert_eq!(json["original_message_base64"], "/wA=");
        assert!(message.kafka_headers().is_none());
    }
}
