// ============================================================================
// Configuration
// ============================================================================
//
// All settings come from the environment (optionally seeded from a .env file)
// with defaults suitable for local development.
//
// ============================================================================

use anyhow::Result;

mod hub;
mod kafka;
mod logging;

pub use hub::HubConfig;
pub use kafka::KafkaConfig;
pub use logging::LoggingConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEALTH_PORT: u16 = 8081;
const DEFAULT_SERVICE_NAME: &str = "messaging-substrate";

/// Top-level configuration for the substrate process
#[derive(Clone, Debug)]
pub struct Config {
    /// Stable identity of this service; doubles as the Kafka consumer group id
    pub service_name: String,
    pub bind_address: String,
    /// WebSocket listener port
    pub port: u16,
    /// HTTP admin listener port (/health, /metrics, collaborator endpoints)
    pub health_port: u16,
    pub rust_log: String,
    pub kafka: KafkaConfig,
    pub hub: HubConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            service_name: std::env::var("SERVICE_NAME")
                .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string()),
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("PORT", DEFAULT_PORT),
            health_port: env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            kafka: KafkaConfig::from_env(),
            hub: HubConfig::from_env(),
            logging: LoggingConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            anyhow::bail!("SERVICE_NAME must not be empty");
        }
        if self.port == self.health_port {
            anyhow::bail!("PORT and HEALTH_PORT must differ");
        }
        self.kafka.validate()?;
        self.hub.validate()?;
        Ok(())
    }
}

/// Parse an environment variable, falling back to `default` when it is unset
/// or unparsable.
pub(crate) fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
