// ============================================================================
// Kafka Configuration
// ============================================================================

use std::time::Duration;

use super::env_parse;

/// Kafka connection and event bus behaviour
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Whether the bus is started by the binary
    pub enabled: bool,
    /// Comma-separated list of Kafka brokers (e.g., "kafka1:9092,kafka2:9092")
    pub brokers: String,
    /// SSL/TLS enabled
    pub ssl_enabled: bool,
    /// Path to CA certificate file (for self-signed certificates)
    pub ssl_ca_location: Option<String>,
    /// SASL mechanism (e.g., "SCRAM-SHA-256", "PLAIN")
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub producer_compression: String, // "zstd" | "snappy" | "gzip" | "lz4" | "none"
    /// Total send attempts per publish (first try included)
    pub publish_attempts: u32,
    /// Backoff unit; attempt n waits n * this before retrying
    pub retry_backoff_ms: u64,
    /// Upper bound for a single send attempt
    pub write_timeout_ms: u64,
    /// Offset commit period for subscriptions
    pub commit_interval_ms: u64,
    /// Metadata fetch timeout used by health checks
    pub health_timeout_ms: u64,
    /// Topic whose `message.created` events become hub notifications
    pub notification_topic: Option<String>,
}

impl KafkaConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            enabled: env_parse("KAFKA_ENABLED", false),
            brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            ssl_enabled: env_parse("KAFKA_SSL_ENABLED", false),
            ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
            sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
            sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
            sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
            producer_compression: std::env::var("KAFKA_PRODUCER_COMPRESSION")
                .unwrap_or_else(|_| "snappy".to_string()),
            publish_attempts: env_parse("KAFKA_PUBLISH_ATTEMPTS", 3),
            retry_backoff_ms: env_parse("KAFKA_RETRY_BACKOFF_MS", 200),
            write_timeout_ms: env_parse("KAFKA_WRITE_TIMEOUT_MS", 5000),
            commit_interval_ms: env_parse("KAFKA_COMMIT_INTERVAL_MS", 1000),
            health_timeout_ms: env_parse("KAFKA_HEALTH_TIMEOUT_MS", 3000),
            notification_topic: std::env::var("HUB_NOTIFICATION_TOPIC")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.publish_attempts == 0 {
            anyhow::bail!("KAFKA_PUBLISH_ATTEMPTS must be at least 1");
        }
        if self.commit_interval_ms == 0 {
            anyhow::bail!("KAFKA_COMMIT_INTERVAL_MS must be positive");
        }
        if self.enabled && self.brokers.trim().is_empty() {
            anyhow::bail!("KAFKA_BROKERS must be set when KAFKA_ENABLED=true");
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            brokers: "localhost:9092".to_string(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            producer_compression: "snappy".to_string(),
            publish_attempts: 3,
            retry_backoff_ms: 200,
            write_timeout_ms: 5000,
            commit_interval_ms: 1000,
            health_timeout_ms: 3000,
            notification_topic: None,
        }
    }
}
