//! Kafka configuration for the camtrack pipeline.
//!
//! Connection, security and client tuning are grouped per concern; each group
//! knows how to write itself into an rdkafka [`ClientConfig`]. The delivery
//! policy (prefetch, retries, reconnect, shutdown drain) is interpreted by the
//! consumer itself rather than by librdkafka.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Transport security between client and brokers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    /// Name understood by librdkafka's `security.protocol`
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn requires_sasl(self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

impl std::str::FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            "sasl_plaintext" => Ok(SecurityProtocol::SaslPlaintext),
            "sasl_ssl" => Ok(SecurityProtocol::SaslSsl),
            other => Err(invalid("security.protocol", format!("unknown protocol {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum SaslMechanism {
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Certificate material for TLS connections; paths are passed to librdkafka as is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub key_password: Option<String>,
    #[serde(default = "default_true")]
    pub verify_certificates: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_file: None,
            cert_file: None,
            key_file: None,
            key_password: None,
            verify_certificates: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaslCredentials {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

/// Everything needed to authenticate against the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub protocol: SecurityProtocol,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub sasl: Option<SaslCredentials>,
}

impl SecurityConfig {
    fn apply(&self, client: &mut ClientConfig) {
        client.set("security.protocol", self.protocol.as_str());

        let tls = [
            ("ssl.ca.location", &self.tls.ca_file),
            ("ssl.certificate.location", &self.tls.cert_file),
            ("ssl.key.location", &self.tls.key_file),
            ("ssl.key.password", &self.tls.key_password),
        ];
        for (key, value) in tls {
            if let Some(value) = value {
                client.set(key, value);
            }
        }
        if !self.tls.verify_certificates {
            client.set("enable.ssl.certificate.verification", "false");
        }

        if let (true, Some(sasl)) = (self.protocol.requires_sasl(), &self.sasl) {
            client
                .set("sasl.mechanism", sasl.mechanism.as_str())
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.requires_sasl() && self.sasl.is_none() {
            return Err(ConfigError::MissingRequired(format!(
                "security.sasl (required for {})",
                self.protocol.as_str()
            )));
        }
        Ok(())
    }
}

/// Producer tuning. The producer only carries dead letters and publisher
/// traffic, so it favours durability over throughput.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Required acknowledgments: 0, 1, or all
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_true")]
    pub idempotent: bool,
    /// librdkafka-level send retries
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_send_backoff_ms")]
    pub send_backoff_ms: u64,
    /// Upper bound on a single delivery, also used as the send timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// none, gzip, snappy, lz4 or zstd
    #[serde(default = "default_compression")]
    pub compression: String,
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_send_retries() -> u32 {
    3
}

fn default_send_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_linger_ms() -> u64 {
    5
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: default_acks(),
            idempotent: true,
            send_retries: default_send_retries(),
            send_backoff_ms: default_send_backoff_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            linger_ms: default_linger_ms(),
            compression: default_compression(),
        }
    }
}

impl ProducerConfig {
    fn apply(&self, client: &mut ClientConfig) {
        client
            .set("acks", &self.acks)
            .set("enable.idempotence", self.idempotent.to_string())
            .set("retries", self.send_retries.to_string())
            .set("retry.backoff.ms", self.send_backoff_ms.to_string())
            .set("request.timeout.ms", self.request_timeout_ms.to_string())
            .set("linger.ms", self.linger_ms.to_string())
            .set("compression.type", &self.compression);
    }
}

/// Consumer group membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Where a new group starts: earliest or latest
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A handler stalled longer than this makes the broker revoke the partitions
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "camtrack-tracker".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30000
}

fn default_heartbeat_interval_ms() -> u64 {
    3000
}

fn default_max_poll_interval_ms() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

impl ConsumerConfig {
    fn apply(&self, client: &mut ClientConfig) {
        client
            .set("group.id", &self.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", self.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", self.max_poll_interval_ms.to_string());
    }
}

/// Delivery policy applied on top of the raw Kafka consumer.
///
/// Offsets are only committed once the handler reports completion, so the
/// prefetch bound is also the bound on uncommitted in-flight messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum number of dispatched but unacknowledged messages
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Redeliveries attempted before a message is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before a failed message is redelivered, doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Initial reconnect delay after a lost broker connection
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Upper bound for the reconnect delay
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Consecutive transport errors treated as a lost connection
    #[serde(default = "default_max_transport_errors")]
    pub max_transport_errors: u32,
    /// Time allowed for in-flight messages to finish on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_prefetch() -> usize {
    256
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30000
}

fn default_max_transport_errors() -> u32 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    15
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            prefetch: default_prefetch(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_transport_errors: default_max_transport_errors(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl DeliveryConfig {
    /// Delay before redelivery attempt `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << exp))
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Detection messages from camera nodes
    #[serde(default = "default_detections_topic")]
    pub detections: String,
    /// Messages that exhausted their redeliveries
    #[serde(default = "default_dlq_topic")]
    pub dead_letter_queue: String,
}

fn default_detections_topic() -> String {
    "camtrack.detections".to_string()
}

fn default_dlq_topic() -> String {
    "camtrack.detections.dlq".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            detections: default_detections_topic(),
            dead_letter_queue: default_dlq_topic(),
        }
    }
}

/// Main Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Raw librdkafka properties, applied last
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "camtrack".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security: SecurityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            delivery: DeliveryConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `KAFKA_*` environment variables; used by the
    /// publisher tool, which has no config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(servers) = var("KAFKA_BOOTSTRAP_SERVERS") {
            config.bootstrap_servers = servers;
        }
        if let Some(client_id) = var("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(group_id) = var("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Some(topic) = var("KAFKA_DETECTIONS_TOPIC") {
            config.topics.detections = topic;
        }
        if let Some(protocol) = var("KAFKA_SECURITY_PROTOCOL") {
            config.security.protocol = protocol.parse()?;
        }
        if let (Some(username), Some(password)) =
            (var("KAFKA_SASL_USERNAME"), var("KAFKA_SASL_PASSWORD"))
        {
            config.security.sasl = Some(SaslCredentials {
                mechanism: SaslMechanism::default(),
                username,
                password,
            });
        }
        config.security.tls.ca_file = var("KAFKA_SSL_CA_LOCATION");
        if let Some(prefetch) = var("KAFKA_PREFETCH") {
            config.delivery.prefetch = prefetch
                .parse()
                .map_err(|_| invalid("KAFKA_PREFETCH", format!("not a positive integer: {}", prefetch)))?;
        }

        Ok(config)
    }

    fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id);
        self.security.apply(&mut client);
        client
    }

    fn with_extras(&self, mut client: ClientConfig) -> ClientConfig {
        for (key, value) in &self.extra_properties {
            client.set(key, value);
        }
        client
    }

    pub fn build_producer_config(&self) -> ClientConfig {
        let mut client = self.client_config();
        self.producer.apply(&mut client);
        self.with_extras(client)
    }

    /// Auto commit and offset store stay off: offsets are committed
    /// explicitly once every earlier message of the partition is done.
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut client = self.client_config();
        self.consumer.apply(&mut client);
        client
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            // librdkafka's local fetch queue stays near the in-flight bound
            .set("queued.min.messages", self.delivery.prefetch.max(1).to_string());
        self.with_extras(client)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("bootstrap_servers", &self.bootstrap_servers),
            ("consumer.group_id", &self.consumer.group_id),
            ("topics.detections", &self.topics.detections),
        ];
        if let Some((key, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::MissingRequired(key.to_string()));
        }

        if self.delivery.prefetch == 0 {
            return Err(invalid("delivery.prefetch", "must be at least 1"));
        }

        self.security.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consumer_config_disables_auto_commit() {
        let consumer_config = KafkaConfig::new("kafka:9092").build_consumer_config();

        assert_eq!(consumer_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(consumer_config.get("group.id"), Some("camtrack-tracker"));
        assert_eq!(consumer_config.get("queued.min.messages"), Some("256"));
        assert!(consumer_config.get("sasl.mechanism").is_none());
    }

    #[test]
    fn test_extra_properties_win() {
        let mut config = KafkaConfig::default();
        config
            .extra_properties
            .insert("linger.ms".to_string(), "50".to_string());

        let producer_config = config.build_producer_config();
        assert_eq!(producer_config.get("linger.ms"), Some("50"));
        assert_eq!(producer_config.get("acks"), Some("all"));
    }

    #[test]
    fn test_sasl_protocol_requires_credentials() {
        let mut config = KafkaConfig::default();
        config.security.protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));

        config.security.sasl = Some(SaslCredentials {
            mechanism: SaslMechanism::ScramSha512,
            username: "svc".to_string(),
            password: "secret".to_string(),
        });
        assert!(config.validate().is_ok());
        assert_eq!(
            config.build_consumer_config().get("sasl.mechanism"),
            Some("SCRAM-SHA-512")
        );
    }

    #[test]
    fn test_unknown_security_protocol_is_rejected() {
        assert_eq!("SASL_SSL".parse::<SecurityProtocol>().unwrap(), SecurityProtocol::SaslSsl);
        assert!("kerberos".parse::<SecurityProtocol>().is_err());
    }

    #[test]
    fn test_zero_prefetch_rejected() {
        let mut config = KafkaConfig::default();
        config.delivery.prefetch = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let delivery = DeliveryConfig {
            retry_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(delivery.retry_delay(1), Duration::from_millis(100));
        assert_eq!(delivery.retry_delay(2), Duration::from_millis(200));
        assert_eq!(delivery.retry_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let json = r#"{"bootstrap_servers": "kafka:9092", "delivery": {"prefetch": 8}}"#;
        let config: KafkaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.delivery.prefetch, 8);
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.topics.detections, "camtrack.detections");
    }
}
