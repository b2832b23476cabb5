//! Messaging configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deployment environment classification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Environment {
    Development,
    Production,
    Testing,
    /// Any environment name the subsystem does not recognise
    Other(String),
}

impl From<String> for Environment {
    fn from(name: String) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Environment::Development,
            "production" | "prod" => Environment::Production,
            "testing" | "test" => Environment::Testing,
            _ => Environment::Other(name),
        }
    }
}

impl From<&str> for Environment {
    fn from(name: &str) -> Self {
        Environment::from(name.to_string())
    }
}

impl From<Environment> for String {
    fn from(env: Environment) -> Self {
        env.to_string()
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
            Environment::Testing => write!(f, "testing"),
            Environment::Other(name) => write!(f, "{}", name),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

/// Concrete transport backing the message bus and dead letter service.
///
/// Chosen once at startup and never swapped afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// NATS broker running next to the application
    LocalBroker,
    /// Hosted Kafka-protocol broker
    ManagedCloudBroker,
    /// No transport I/O at all
    Disabled,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::LocalBroker => "local_broker",
            TransportMode::ManagedCloudBroker => "managed_cloud_broker",
            TransportMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NATS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,

    /// Connection name
    pub connection_name: String,

    /// Optional credentials token
    pub token: Option<String>,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Ping interval in seconds
    pub ping_interval_secs: u64,

    /// JetStream stream holding dead letters
    pub dead_letter_stream: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_NATS_SERVER.to_string()],
            connection_name: "reliable-messaging".to_string(),
            token: None,
            request_timeout_ms: 5000,
            ping_interval_secs: 60,
            dead_letter_stream: "DEAD_LETTERS".to_string(),
        }
    }
}

/// Default local broker address
pub const DEFAULT_NATS_SERVER: &str = "nats://localhost:4222";

/// Default Kafka bootstrap address
pub const DEFAULT_KAFKA_BOOTSTRAP: &str = "localhost:9092";

/// Kafka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (the connection string of the managed broker)
    pub bootstrap_servers: String,

    /// Client ID
    pub client_id: String,

    /// Consumer group ID used when a subscription does not name one
    pub group_id: String,

    /// Enable SASL authentication
    pub enable_sasl: bool,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// Enable SSL/TLS
    pub enable_ssl: bool,

    /// Compression type (none, gzip, snappy, lz4, zstd)
    pub compression_type: String,

    /// Message timeout in milliseconds
    pub message_timeout_ms: u64,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u64,

    /// Longest gap between consumer polls before the group evicts the
    /// member. Covers handler time; retry backoff is added on top.
    pub max_poll_interval_ms: u64,

    /// Partitions for topics created by `ensure_infrastructure`
    pub partitions: i32,

    /// Replication factor for topics created by `ensure_infrastructure`
    pub replication_factor: i32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: DEFAULT_KAFKA_BOOTSTRAP.to_string(),
            client_id: "reliable-messaging".to_string(),
            group_id: "reliable-messaging".to_string(),
            enable_sasl: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            enable_ssl: false,
            compression_type: "snappy".to_string(),
            message_timeout_ms: 30000,
            session_timeout_ms: 30000,
            max_poll_interval_ms: 300000,
            partitions: 1,
            replication_factor: 1,
        }
    }
}

impl KafkaConfig {
    /// Security protocol implied by the SASL and SSL flags
    pub fn security_protocol(&self) -> &'static str {
        match (self.enable_sasl, self.enable_ssl) {
            (true, _) => "SASL_SSL",
            (false, true) => "SSL",
            (false, false) => "PLAINTEXT",
        }
    }
}

/// Main messaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Enable messaging system
    pub enabled: bool,

    /// Default topic prefix
    pub topic_prefix: String,

    /// Queue used by `send` when no destination is given
    pub default_queue: String,

    /// Topic used by `publish` and `subscribe` when none is given
    pub default_topic: String,

    /// Subscription name used when the caller does not give one
    pub default_subscription: String,

    /// NATS configuration
    pub nats: NatsConfig,

    /// Kafka configuration
    pub kafka: KafkaConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic_prefix: "app".to_string(),
            default_queue: "commands".to_string(),
            default_topic: "integration-events".to_string(),
            default_subscription: "default".to_string(),
            nats: NatsConfig::default(),
            kafka: KafkaConfig::default(),
        }
    }
}

impl MessagingConfig {
    /// Get full topic name with prefix
    pub fn full_topic(&self, topic: &str) -> String {
        format!("{}.{}", self.topic_prefix, topic)
    }

    /// Destination for `send`, falling back to the default queue
    pub fn queue_or_default<'a>(&'a self, destination: Option<&'a str>) -> &'a str {
        destination.unwrap_or(&self.default_queue)
    }

    /// Topic for `publish`, falling back to the default topic
    pub fn topic_or_default<'a>(&'a self, topic: Option<&'a str>) -> &'a str {
        topic.unwrap_or(&self.default_topic)
    }

    /// Subscription name, falling back to the default subscription
    pub fn subscription_or_default<'a>(&'a self, subscription: Option<&'a str>) -> &'a str {
        subscription.unwrap_or(&self.default_subscription)
    }
}

/// Whether a configured value is missing or still an unresolved template
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }

    if (trimmed.starts_with("${") && trimmed.ends_with('}'))
        || (trimmed.starts_with('<') && trimmed.ends_with('>'))
    {
        return true;
    }

    let lower = trimmed.to_ascii_lowercase();
    ["placeholder", "changeme", "change-me", "your-", "your_"]
        .iter()
        .any(|marker| lower.contains(marker))
}
