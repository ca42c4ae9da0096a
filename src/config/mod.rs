//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

use crate::bus::{AckPolicy, BrokerConfig, BrokerType};
use crate::server::http::HttpConfig;
use crate::telemetry::TelemetryConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Identity of this service, recorded on every exported span.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub id: i64,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            id: 1,
            environment: "development".to_string(),
        }
    }
}

/// Event routing configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Queue that receives todo-created notifications.
    pub queue: String,
    /// Acknowledgement policy for the notification consumer.
    pub ack_policy: AckPolicy,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue: "todo.create".to_string(),
            ack_policy: AckPolicy::Immediate,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service identity.
    pub app: AppConfig,
    /// HTTP listener configuration.
    pub http: HttpConfig,
    /// Broker configuration.
    pub broker: BrokerConfig,
    /// Event routing configuration.
    pub events: EventsConfig,
    /// Tracing export configuration.
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing: in-memory broker, ephemeral loopback port,
    /// no span export.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.http.host = "127.0.0.1".to_string();
        config.http.port = 0;
        config.broker.broker_type = BrokerType::Memory;
        config.telemetry.enabled = false;
        config
    }
}

/// Config path from the first command line argument, if any.
pub fn parse_config_path() -> Option<String> {
    std::env::args().nth(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.app.name, "courier");
        assert_eq!(config.http.port, 8080);
        assert_eq!(config.http.shutdown_timeout_secs, 5);
        assert_eq!(config.broker.broker_type, BrokerType::Amqp);
        assert_eq!(config.events.queue, "todo.create");
        assert_eq!(config.events.ack_policy, AckPolicy::Immediate);
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.http.host, "127.0.0.1");
        assert_eq!(config.http.port, 0);
        assert_eq!(config.broker.broker_type, BrokerType::Memory);
        assert!(!config.telemetry.enabled);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = std::env::temp_dir().join(format!("courier-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("courier-test.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "app:\n  name: notifier\n  id: 7\nhttp:\n  port: 9090\nbroker:\n  type: memory\nevents:\n  queue: send_email\n  ack_policy: after_success\ntelemetry:\n  otlp_endpoint: http://collector:4317"
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.app.name, "notifier");
        assert_eq!(config.app.id, 7);
        assert_eq!(config.app.environment, "development");
        assert_eq!(config.http.port, 9090);
        assert_eq!(config.broker.broker_type, BrokerType::Memory);
        assert_eq!(config.events.queue, "send_email");
        assert_eq!(config.events.ack_policy, AckPolicy::AfterSuccess);
        assert_eq!(
            config.telemetry.otlp_endpoint.as_deref(),
            Some("http://collector:4317")
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_required_file_fails() {
        let result = Config::load(Some("/nonexistent/courier.yaml"));
        assert!(result.is_err());
    }
}
