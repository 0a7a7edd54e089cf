//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod processing;

pub use messaging::{
    AmqpSettings, NotificationSettings, RpcSettings, TransportSettings, TransportType,
    DEFAULT_NOTIFICATION_QUEUE, DEFAULT_REQUEST_QUEUE,
};
pub use processing::{EngineType, OcrSettings};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RPCBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RPCBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RPCBUS_LOG";

use serde::Deserialize;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub amqp: AmqpSettings,
    /// Request/reply settings.
    pub rpc: RpcSettings,
    /// Notification queue and transport.
    pub notification: NotificationSettings,
    /// OCR worker settings.
    pub ocr: OcrSettings,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
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

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a role unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc.request_queue.is_empty() {
            return Err(ConfigError::Invalid(
                "rpc.request_queue is empty".to_string(),
            ));
        }
        if self.rpc.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "rpc.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.rpc.prefetch == 0 {
            return Err(ConfigError::Invalid("rpc.prefetch must be > 0".to_string()));
        }
        if self.notification.queue.is_empty() {
            return Err(ConfigError::Invalid(
                "notification.queue is empty".to_string(),
            ));
        }
        if self.notification.prefetch == 0 {
            return Err(ConfigError::Invalid(
                "notification.prefetch must be > 0".to_string(),
            ));
        }
        if self.notification.transport.transport_type == TransportType::Webhook
            && self.notification.transport.url.is_none()
        {
            return Err(ConfigError::Invalid(
                "notification.transport.url is required for webhook transport".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.rpc.request_queue, DEFAULT_REQUEST_QUEUE);
        assert_eq!(config.notification.queue, DEFAULT_NOTIFICATION_QUEUE);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "amqp:\n  url: amqp://rabbit:5672\n\
             rpc:\n  prefetch: 4\n  timeout_secs: 5\n\
             ocr:\n  engine: command"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.rpc.prefetch, 4);
        assert_eq!(config.rpc.timeout_secs, 5);
        assert_eq!(config.ocr.engine, EngineType::Command);
        // Unspecified sections keep their defaults
        assert_eq!(config.notification.queue, DEFAULT_NOTIFICATION_QUEUE);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("RPCBUS__AMQP__URL", "amqp://env-host:5672");
        std::env::set_var("RPCBUS__RPC__DURABLE", "true");

        let result = Config::load(None);

        std::env::remove_var("RPCBUS__AMQP__URL");
        std::env::remove_var("RPCBUS__RPC__DURABLE");

        let config = result.unwrap();
        assert_eq!(config.amqp.url, "amqp://env-host:5672");
        assert!(config.rpc.durable);
    }

    #[test]
    fn test_zero_prefetch_rejected() {
        let mut config = Config::for_test();
        config.rpc.prefetch = 0;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("rpc.prefetch")),
            other => panic!("expected Invalid, got {other:?}"),
        }

        let mut config = Config::for_test();
        config.notification.prefetch = 0;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("notification.prefetch")),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_load_rejects_zero_prefetch_from_env() {
        std::env::set_var("RPCBUS__RPC__PREFETCH", "0");

        let result = Config::load(None);

        std::env::remove_var("RPCBUS__RPC__PREFETCH");

        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_webhook_requires_url() {
        let mut config = Config::for_test();
        config.notification.transport.transport_type = TransportType::Webhook;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.notification.transport.url = Some("http://relay/send".to_string());
        assert!(config.validate().is_ok());
    }
}
