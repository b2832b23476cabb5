use crate::error::{AppError, Result};
use crate::messaging::{Environment, MessagingConfig};
use crate::retry::RetryPolicyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Environment variable naming an optional override file
pub const CONFIG_PATH_ENV: &str = "RELIABLE_MESSAGING_CONFIG";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Deployment environment, drives transport selection
    #[serde(default)]
    pub environment: Environment,

    /// Messaging configuration
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Retry policy and dead letter settings
    #[serde(default)]
    pub dead_letter: RetryPolicyConfig,

    /// Event type registry configuration
    #[serde(default)]
    pub event_registry: EventRegistryConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from the embedded defaults, the file named by
    /// `RELIABLE_MESSAGING_CONFIG` and `RM__*` environment variables
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref().map(Path::new))
    }

    /// Load configuration with an explicit override file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: AppConfig = builder
            // Override with environment variables (RM__MESSAGING__ENABLED=false)
            .add_source(
                config::Environment::with_prefix("RM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check the sections that have hard bounds
    pub fn validate(&self) -> Result<()> {
        self.dead_letter.validate()?;
        if self.event_registry.cache_ttl_secs == 0 {
            return Err(AppError::Validation(
                "event_registry.cache_ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            messaging: MessagingConfig::default(),
            dead_letter: RetryPolicyConfig::default(),
            event_registry: EventRegistryConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRegistryConfig {
    /// Catalog lifetime before an automatic rebuild
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl EventRegistryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for EventRegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_load() {
        let config = AppConfig::load_from(None).unwrap();
        assert_eq!(config.messaging.topic_prefix, "app");
        assert_eq!(config.dead_letter.max_retry_attempts, 3);
        assert_eq!(config.event_registry.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
environment = "production"

[messaging]
enabled = false

[dead_letter]
max_retry_attempts = 5
enable_detailed_logging = true
"#
        )
        .unwrap();

        let config = AppConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert!(!config.messaging.enabled);
        assert_eq!(config.dead_letter.max_retry_attempts, 5);
        assert!(config.dead_letter.enable_detailed_logging);
        assert_eq!(config.dead_letter.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[dead_letter]\nmax_retry_attempts = 0").unwrap();

        let err = AppConfig::load_from(Some(file.path())).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_unknown_environment_is_kept() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "environment = \"staging\"").unwrap();

        let config = AppConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.environment, Environment::Other("staging".to_string()));
    }
}
