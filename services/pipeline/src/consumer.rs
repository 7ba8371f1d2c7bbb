//! Kafka consumer with explicit acknowledgment for the camtrack pipeline.
//!
//! Messages are handed to a [`MessageHandler`] in delivery order. The handler
//! returns a completion future; the offset of a message becomes committable
//! only after that future resolves to an acknowledging [`HandlerOutcome`] and
//! every earlier offset of the same partition has done the same. Failed
//! messages are redelivered in-process with exponential backoff and parked on
//! the dead-letter topic once the retry budget is spent.

use crate::config::{DeliveryConfig, KafkaConfig};
use crate::offsets::{OffsetTracker, PartitionKey};
use crate::producer::{ProducerError, QueueProducer, MESSAGE_ID_HEADER};
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::BoxFuture;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur during message consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    #[error("Consumer shutdown")]
    Shutdown,
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Message key (if present)
    pub key: Option<Vec<u8>>,
    /// Broker timestamp in epoch milliseconds
    pub timestamp: Option<i64>,
    /// Message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload
    pub payload: Vec<u8>,
    /// Message metadata
    pub metadata: MessageMetadata,
    /// Delivery attempt, 1 for the first delivery
    pub attempt: u32,
}

impl IncomingMessage {
    /// Deserialize the payload as JSON
    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ConsumerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ConsumerError::DeserializationError(e.to_string()))
    }

    /// Get the message key as a string
    pub fn key_str(&self) -> Option<String> {
        self.metadata
            .key
            .as_ref()
            .and_then(|k| String::from_utf8(k.clone()).ok())
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Get the message id header
    pub fn message_id(&self) -> Option<&str> {
        self.header(MESSAGE_ID_HEADER)
    }

    fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.metadata.topic.clone(), self.metadata.partition)
    }
}

/// How a handler finished with a message
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Fully processed; acknowledge
    Ack,
    /// Permanently unprocessable; acknowledge without retrying
    Drop { reason: String },
    /// Transient failure; do not acknowledge, redeliver later
    Retry { reason: String },
}

/// Resolves once the pipeline is done with a dispatched message
pub type Completion = BoxFuture<'static, HandlerOutcome>;

/// Handler trait for processing messages.
///
/// `dispatch` is awaited in delivery order and should only enqueue the
/// message (applying backpressure if its queue is full); the returned
/// [`Completion`] is awaited concurrently with later deliveries.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn dispatch(&self, message: IncomingMessage) -> Completion;
}

/// Destination for messages that exhausted their redeliveries
#[async_trait::async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn dead_letter(
        &self,
        message: &IncomingMessage,
        attempts: u32,
        reason: &str,
    ) -> Result<(), ProducerError>;
}

#[async_trait::async_trait]
impl DeadLetterSink for QueueProducer {
    async fn dead_letter(
        &self,
        message: &IncomingMessage,
        attempts: u32,
        reason: &str,
    ) -> Result<(), ProducerError> {
        self.send_to_dlq(message, attempts, reason).await.map(|_| ())
    }
}

/// A message whose completion future resolved
pub struct Completed {
    message: IncomingMessage,
    outcome: HandlerOutcome,
    permit: OwnedSemaphorePermit,
}

/// Dispatch, retry and acknowledgment bookkeeping independent of the broker
/// connection.
pub struct Delivery<H: MessageHandler> {
    handler: Arc<H>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    config: DeliveryConfig,
    tracker: OffsetTracker,
    permits: Arc<Semaphore>,
    completed_tx: mpsc::UnboundedSender<Completed>,
    completed_rx: mpsc::UnboundedReceiver<Completed>,
    retries_enabled: bool,
}

impl<H: MessageHandler> Delivery<H> {
    pub fn new(
        handler: Arc<H>,
        dead_letters: Option<Arc<dyn DeadLetterSink>>,
        config: DeliveryConfig,
    ) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(config.prefetch.max(1)));
        Self {
            handler,
            dead_letters,
            config,
            tracker: OffsetTracker::new(),
            permits,
            completed_tx,
            completed_rx,
            retries_enabled: true,
        }
    }

    /// Semaphore bounding dispatched-but-unfinished messages
    pub fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    /// Messages dispatched whose outcome is not final yet
    pub fn outstanding(&self) -> usize {
        self.config.prefetch.max(1) - self.permits.available_permits()
    }

    /// Hand a freshly received message to the handler
    pub async fn accept(&mut self, message: IncomingMessage, permit: OwnedSemaphorePermit) {
        self.tracker
            .begin(&message.partition_key(), message.metadata.offset);
        let completion = self.handler.dispatch(message.clone()).await;
        let tx = self.completed_tx.clone();
        tokio::spawn(async move {
            let outcome = completion.await;
            let _ = tx.send(Completed {
                message,
                outcome,
                permit,
            });
        });
    }

    /// Wait for the next resolved completion
    pub async fn next_completed(&mut self) -> Completed {
        // The sender half lives in `self`, so the channel never closes.
        match self.completed_rx.recv().await {
            Some(done) => done,
            None => futures::future::pending().await,
        }
    }

    /// Apply the acknowledgment policy to a resolved completion
    pub async fn on_completed(&mut self, done: Completed) {
        let Completed {
            message,
            outcome,
            permit,
        } = done;
        let meta = &message.metadata;

        match outcome {
            HandlerOutcome::Ack => {
                metrics::counter!("pipeline.messages.acked").increment(1);
                self.tracker.complete(&message.partition_key(), meta.offset);
            }
            HandlerOutcome::Drop { reason } => {
                metrics::counter!("pipeline.messages.dropped").increment(1);
                warn!(
                    partition = meta.partition,
                    offset = meta.offset,
                    reason = %reason,
                    "Dropping unprocessable message"
                );
                self.tracker.complete(&message.partition_key(), meta.offset);
            }
            HandlerOutcome::Retry { reason } => {
                if !self.retries_enabled {
                    warn!(
                        partition = meta.partition,
                        offset = meta.offset,
                        "Leaving failed message uncommitted for redelivery after restart"
                    );
                    return;
                }

                if message.attempt > self.config.max_retries {
                    self.dead_letter(message, &reason, permit).await;
                    return;
                }

                metrics::counter!("pipeline.messages.retried").increment(1);
                let delay = self.config.retry_delay(message.attempt);
                warn!(
                    partition = meta.partition,
                    offset = meta.offset,
                    attempt = message.attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Message processing failed, scheduling redelivery"
                );

                let handler = self.handler.clone();
                let tx = self.completed_tx.clone();
                let mut retry = message;
                retry.attempt += 1;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let outcome = handler.dispatch(retry.clone()).await.await;
                    let _ = tx.send(Completed {
                        message: retry,
                        outcome,
                        permit,
                    });
                });
            }
        }
    }

    async fn dead_letter(
        &mut self,
        message: IncomingMessage,
        reason: &str,
        permit: OwnedSemaphorePermit,
    ) {
        let meta = &message.metadata;
        let attempts = message.attempt;

        match &self.dead_letters {
            Some(sink) => {
                if let Err(e) = sink.dead_letter(&message, attempts, reason).await {
                    // Keep the offset uncommitted; the message returns on restart.
                    error!(
                        partition = meta.partition,
                        offset = meta.offset,
                        error = %e,
                        "Failed to send message to dead-letter topic"
                    );
                    drop(permit);
                    return;
                }
                error!(
                    partition = meta.partition,
                    offset = meta.offset,
                    attempts = attempts,
                    reason = %reason,
                    "Message dead-lettered after exhausting retries"
                );
            }
            None => {
                error!(
                    partition = meta.partition,
                    offset = meta.offset,
                    attempts = attempts,
                    reason = %reason,
                    "Discarding message after exhausting retries (no dead-letter topic)"
                );
            }
        }

        metrics::counter!("pipeline.messages.dead_lettered").increment(1);
        self.tracker.complete(&message.partition_key(), meta.offset);
        drop(permit);
    }

    /// Commit positions that advanced since the last call
    pub fn take_commits(&mut self) -> Vec<(PartitionKey, i64)> {
        self.tracker.take_committable()
    }

    /// Resolve outstanding completions until none remain or the timeout hits.
    /// Failed messages are no longer redelivered in-process once draining.
    pub async fn drain(&mut self, timeout: std::time::Duration) -> bool {
        self.retries_enabled = false;
        let deadline = tokio::time::Instant::now() + timeout;

        while self.outstanding() > 0 {
            match tokio::time::timeout_at(deadline, self.next_completed()).await {
                Ok(done) => self.on_completed(done).await,
                Err(_) => {
                    warn!(
                        outstanding = self.outstanding(),
                        "Drain timed out with messages still in flight"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Forget offsets of a torn-down session
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.retries_enabled = true;
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

/// High-level Kafka consumer wrapper
pub struct QueueConsumer {
    config: Arc<KafkaConfig>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    /// Create a new consumer with the given configuration
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config: Arc::new(config),
            dead_letters: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the dead letter queue producer
    pub fn with_dlq_producer(mut self, producer: Arc<QueueProducer>) -> Self {
        self.dead_letters = Some(producer as Arc<dyn DeadLetterSink>);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Token that stops consumption when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown to stop consuming
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        self.shutdown.cancel();
    }

    fn create_consumer(&self) -> Result<StreamConsumer, ConsumerError> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[self.config.topics.detections.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))?;

        Ok(consumer)
    }

    /// Create and subscribe a consumer, retrying with exponential backoff
    async fn connect_with_retry(&self) -> Result<StreamConsumer, ConsumerError> {
        let delivery = &self.config.delivery;
        let mut backoff = reconnect_backoff(delivery);
        let mut attempts = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(ConsumerError::Shutdown);
            }

            match self.create_consumer() {
                Ok(consumer) => {
                    info!(
                        brokers = %self.config.bootstrap_servers,
                        group = %self.config.consumer.group_id,
                        topic = %self.config.topics.detections,
                        attempts = attempts,
                        "Subscribed to detection topic"
                    );
                    return Ok(consumer);
                }
                Err(e) => {
                    attempts += 1;
                    let delay = backoff.next_backoff().unwrap_or(delivery.reconnect_max());
                    warn!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Kafka connection failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(ConsumerError::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Consume until shutdown, reconnecting whenever the broker connection is lost
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        let mut delivery = Delivery::new(
            handler,
            self.dead_letters.clone(),
            self.config.delivery.clone(),
        );

        loop {
            let consumer = match self.connect_with_retry().await {
                Ok(consumer) => consumer,
                Err(ConsumerError::Shutdown) => break,
                Err(e) => return Err(e),
            };

            let end = self.consume_session(&consumer, &mut delivery).await;

            let drained = delivery.drain(self.config.delivery.shutdown_timeout()).await;
            self.commit(&consumer, &mut delivery, CommitMode::Sync);
            info!(drained = drained, "Consumer session closed");

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Reconnect => {
                    warn!("Lost broker connection, reconnecting");
                    delivery.reset();
                }
            }
        }

        Ok(())
    }

    async fn consume_session<H: MessageHandler>(
        &self,
        consumer: &StreamConsumer,
        delivery: &mut Delivery<H>,
    ) -> SessionEnd {
        use tokio_stream::StreamExt;

        let permits = delivery.permits();
        let stream = consumer.stream();
        tokio::pin!(stream);
        let mut transport_errors = 0u32;

        info!("Starting message consumption loop");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    return SessionEnd::Shutdown;
                }
                done = delivery.next_completed() => {
                    delivery.on_completed(done).await;
                    self.commit(consumer, delivery, CommitMode::Async);
                }
                (permit, next) = async {
                    let permit = permits.clone().acquire_owned().await;
                    (permit, stream.next().await)
                } => {
                    let Ok(permit) = permit else {
                        return SessionEnd::Shutdown;
                    };
                    match next {
                        Some(Ok(borrowed)) => {
                            transport_errors = 0;
                            let incoming = convert_message(&borrowed);
                            debug!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                "Received message"
                            );
                            delivery.accept(incoming, permit).await;
                        }
                        Some(Err(e)) => {
                            if is_transport_error(&e) {
                                transport_errors += 1;
                                warn!(error = %e, count = transport_errors, "Kafka transport error");
                                if transport_errors >= self.config.delivery.max_transport_errors {
                                    return SessionEnd::Reconnect;
                                }
                            } else {
                                error!(error = %e, "Kafka error");
                            }
                        }
                        None => {
                            debug!("Stream ended");
                            return SessionEnd::Reconnect;
                        }
                    }
                }
            }
        }
    }

    fn commit<H: MessageHandler>(
        &self,
        consumer: &StreamConsumer,
        delivery: &mut Delivery<H>,
        mode: CommitMode,
    ) {
        let positions = delivery.take_commits();
        if positions.is_empty() {
            return;
        }

        let mut tpl = TopicPartitionList::new();
        for (key, position) in &positions {
            if let Err(e) =
                tpl.add_partition_offset(&key.topic, key.partition, Offset::Offset(*position))
            {
                warn!(error = %e, partition = key.partition, "Invalid commit position");
            }
        }

        match consumer.commit(&tpl, mode) {
            Ok(()) => debug!(partitions = positions.len(), "Committed offsets"),
            Err(e) => warn!(error = %e, "Failed to commit offsets"),
        }
    }
}

fn is_transport_error(error: &KafkaError) -> bool {
    matches!(
        error,
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure
        )
    )
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    let payload = msg.payload().unwrap_or(&[]).to_vec();
    let key = msg.key().map(|k| k.to_vec());

    let mut headers = HashMap::new();
    if let Some(h) = msg.headers() {
        for header in h.iter() {
            if let Some(value) = header.value {
                if let Ok(v) = String::from_utf8(value.to_vec()) {
                    headers.insert(header.key.to_string(), v);
                }
            }
        }
    }

    IncomingMessage {
        payload,
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            timestamp: msg.timestamp().to_millis(),
            headers,
        },
        attempt: 1,
    }
}

/// Reconnect delays, starting at `reconnect_base` and never giving up
fn reconnect_backoff(delivery: &DeliveryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(delivery.reconnect_base())
        .with_max_interval(delivery.reconnect_max())
        .with_max_elapsed_time(None)
        .build()
}

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) fn message(partition: i32, offset: i64) -> IncomingMessage {
        let mut headers = HashMap::new();
        headers.insert(MESSAGE_ID_HEADER.to_string(), format!("msg-{}", offset));
        IncomingMessage {
            payload: br#"{"camera_id":"cam-1"}"#.to_vec(),
            metadata: MessageMetadata {
                topic: "camtrack.detections".to_string(),
                partition,
                offset,
                key: Some(b"cam-1".to_vec()),
                timestamp: Some(1_700_000_000_000),
                headers,
            },
            attempt: 1,
        }
    }

    /// Returns a fixed outcome, counting dispatches
    struct FixedHandler {
        outcome: HandlerOutcome,
        dispatched: AtomicU32,
    }

    #[async_trait::async_trait]
    impl MessageHandler for FixedHandler {
        async fn dispatch(&self, _message: IncomingMessage) -> Completion {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            let outcome = self.outcome.clone();
            async move { outcome }.boxed()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        parked: Mutex<Vec<(i64, u32)>>,
    }

    #[async_trait::async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn dead_letter(
            &self,
            message: &IncomingMessage,
            attempts: u32,
            _reason: &str,
        ) -> Result<(), ProducerError> {
            self.parked
                .lock()
                .unwrap()
                .push((message.metadata.offset, attempts));
            Ok(())
        }
    }

    fn delivery_config(max_retries: u32) -> DeliveryConfig {
        DeliveryConfig {
            prefetch: 4,
            max_retries,
            retry_backoff_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_incoming_message_headers() {
        let message = message(0, 100);
        assert_eq!(message.message_id(), Some("msg-100"));
        assert_eq!(message.key_str(), Some("cam-1".to_string()));
    }

    #[tokio::test]
    async fn test_ack_makes_offset_committable() {
        let handler = Arc::new(FixedHandler {
            outcome: HandlerOutcome::Ack,
            dispatched: AtomicU32::new(0),
        });
        let mut delivery = Delivery::new(handler, None, delivery_config(3));

        let permit = delivery.permits().acquire_owned().await.unwrap();
        delivery.accept(message(0, 7), permit).await;
        assert_eq!(delivery.outstanding(), 1);

        let done = delivery.next_completed().await;
        delivery.on_completed(done).await;

        let commits = delivery.take_commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].1, 8);
        assert_eq!(delivery.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drop_is_acknowledged_without_retry() {
        let handler = Arc::new(FixedHandler {
            outcome: HandlerOutcome::Drop {
                reason: "bad".to_string(),
            },
            dispatched: AtomicU32::new(0),
        });
        let mut delivery = Delivery::new(handler.clone(), None, delivery_config(3));

        let permit = delivery.permits().acquire_owned().await.unwrap();
        delivery.accept(message(0, 1), permit).await;
        let done = delivery.next_completed().await;
        delivery.on_completed(done).await;

        assert_eq!(delivery.take_commits()[0].1, 2);
        assert_eq!(handler.dispatched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_dead_letter() {
        let handler = Arc::new(FixedHandler {
            outcome: HandlerOutcome::Retry {
                reason: "storage down".to_string(),
            },
            dispatched: AtomicU32::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let mut delivery = Delivery::new(
            handler.clone(),
            Some(sink.clone() as Arc<dyn DeadLetterSink>),
            delivery_config(2),
        );

        let permit = delivery.permits().acquire_owned().await.unwrap();
        delivery.accept(message(3, 42), permit).await;

        // first delivery + two redeliveries, then dead-lettered
        for _ in 0..3 {
            let done = delivery.next_completed().await;
            delivery.on_completed(done).await;
        }

        assert_eq!(handler.dispatched.load(Ordering::SeqCst), 3);
        assert_eq!(*sink.parked.lock().unwrap(), vec![(42, 3)]);
        assert_eq!(delivery.take_commits()[0].1, 43);
        assert_eq!(delivery.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drain_abandons_failed_messages_uncommitted() {
        let handler = Arc::new(FixedHandler {
            outcome: HandlerOutcome::Retry {
                reason: "storage down".to_string(),
            },
            dispatched: AtomicU32::new(0),
        });
        let mut delivery = Delivery::new(handler, None, delivery_config(5));

        let permit = delivery.permits().acquire_owned().await.unwrap();
        delivery.accept(message(0, 9), permit).await;

        assert!(delivery.drain(Duration::from_secs(1)).await);
        assert!(delivery.take_commits().is_empty());
        assert_eq!(delivery.outstanding(), 0);
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(is_transport_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown
        )));
        assert!(!is_transport_error(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition
        )));
    }

    #[test]
    fn test_reconnect_backoff_starts_at_configured_base() {
        let delivery = DeliveryConfig {
            reconnect_base_ms: 10_000,
            reconnect_max_ms: 60_000,
            ..Default::default()
        };
        let mut backoff = reconnect_backoff(&delivery);

        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_secs(5), "first delay {:?}", first);
        assert!(first <= Duration::from_secs(15), "first delay {:?}", first);
        assert!(backoff.max_elapsed_time.is_none());
    }
}
