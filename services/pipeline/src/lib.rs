//! Camtrack Pipeline - Kafka delivery plumbing for detection events
//!
//! This library provides the queue side of the camtrack tracking service:
//!
//! - A manual-acknowledgment consumer with bounded prefetch, in-process
//!   redelivery and a dead-letter topic
//! - Per-partition offset tracking so out-of-order completions never commit
//!   past an unfinished message
//! - A producer used for dead-lettering and by the `detection-publisher` tool
//!
//! # Example
//!
//! ```rust,no_run
//! use camtrack_pipeline::prelude::*;
//! use futures::FutureExt;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl MessageHandler for Printer {
//!     async fn dispatch(&self, message: IncomingMessage) -> Completion {
//!         println!("{} bytes", message.payload.len());
//!         async { HandlerOutcome::Ack }.boxed()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = Arc::new(QueueProducer::new(config.clone())?);
//!     let consumer = QueueConsumer::new(config).with_dlq_producer(producer);
//!     consumer.run(Arc::new(Printer)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod offsets;
pub mod producer;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, DeliveryConfig, KafkaConfig, ProducerConfig, SaslCredentials,
    SaslMechanism, SecurityConfig, SecurityProtocol, TlsConfig, TopicConfig,
};
pub use consumer::{
    async_trait, Completion, ConsumerError, DeadLetterSink, HandlerOutcome, IncomingMessage,
    MessageHandler, MessageMetadata, QueueConsumer,
};
pub use offsets::{OffsetTracker, PartitionKey};
pub use producer::{DeliveryResult, OutgoingMessage, ProducerError, QueueProducer, MESSAGE_ID_HEADER};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::KafkaConfig;
    pub use crate::consumer::{
        async_trait, Completion, ConsumerError, HandlerOutcome, IncomingMessage, MessageHandler,
        QueueConsumer,
    };
    pub use crate::producer::{OutgoingMessage, ProducerError, QueueProducer};
}
