//! Transport resolution and the generic factory shared by the message bus and
//! the dead letter service

use crate::messaging::config::{
    is_placeholder, Environment, MessagingConfig, TransportMode, DEFAULT_NATS_SERVER,
};
use crate::messaging::credentials::CredentialCache;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::kafka::KafkaMessageBus;
use crate::messaging::nats::NatsMessageBus;
use crate::messaging::noop::NoopMessageBus;
use crate::messaging::traits::MessageBus;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of mapping `{enabled, environment}` to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResolution {
    pub mode: TransportMode,
    pub environment: Environment,
    /// Set when the environment could not be mapped to a transport
    pub gap: Option<String>,
}

/// Map the enabled flag and environment to exactly one transport.
///
/// | enabled | environment | transport          |
/// |---------|-------------|--------------------|
/// | false   | any         | disabled           |
/// | true    | development | local broker       |
/// | true    | production  | managed cloud      |
/// | true    | testing     | disabled           |
/// | true    | other       | disabled, gap set  |
///
/// Testing runs without a transport; harnesses inject their own bus.
pub fn resolve_transport_mode(enabled: bool, environment: &Environment) -> TransportResolution {
    let (mode, gap) = match (enabled, environment) {
        (false, _) => (TransportMode::Disabled, None),
        (true, Environment::Development) => (TransportMode::LocalBroker, None),
        (true, Environment::Production) => (TransportMode::ManagedCloudBroker, None),
        (true, Environment::Testing) => (TransportMode::Disabled, None),
        (true, Environment::Other(name)) => (
            TransportMode::Disabled,
            Some(format!(
                "environment '{}' has no transport mapping; messaging runs disabled until it is \
                 set to development, production or testing",
                name
            )),
        ),
    };

    TransportResolution {
        mode,
        environment: environment.clone(),
        gap,
    }
}

/// Messaging configuration checked against the resolved transport
#[derive(Debug, Clone)]
pub struct PreparedTransport {
    pub resolution: TransportResolution,
    /// Configuration with defaults substituted for unresolved values
    pub config: MessagingConfig,
    pub warnings: Vec<String>,
}

/// Check the connection settings the resolved transport needs.
///
/// In production any missing or placeholder value is a fatal configuration
/// error. Everywhere else it is reported as a warning and a default is used.
pub fn prepare_transport(
    config: &MessagingConfig,
    environment: &Environment,
) -> MessagingResult<PreparedTransport> {
    let resolution = resolve_transport_mode(config.enabled, environment);
    let mut prepared = config.clone();
    let mut issues: Vec<String> = Vec::new();

    if let Some(gap) = &resolution.gap {
        issues.push(gap.clone());
    }

    if config.enabled {
        let defaults = MessagingConfig::default();
        if is_placeholder(&config.default_topic) {
            issues.push(format!("messaging.default_topic '{}' is unresolved", config.default_topic));
            prepared.default_topic = defaults.default_topic.clone();
        }
        if is_placeholder(&config.default_queue) {
            issues.push(format!("messaging.default_queue '{}' is unresolved", config.default_queue));
            prepared.default_queue = defaults.default_queue.clone();
        }

        match resolution.mode {
            TransportMode::LocalBroker => {
                let unresolved = config.nats.servers.is_empty()
                    || config.nats.servers.iter().any(|s| is_placeholder(s));
                if unresolved {
                    issues.push(format!(
                        "messaging.nats.servers {:?} is unresolved, using {}",
                        config.nats.servers, DEFAULT_NATS_SERVER
                    ));
                    prepared.nats.servers = vec![DEFAULT_NATS_SERVER.to_string()];
                }
            }
            TransportMode::ManagedCloudBroker | TransportMode::Disabled => {
                let kafka = &config.kafka;
                if is_placeholder(&kafka.bootstrap_servers) {
                    issues.push(format!(
                        "messaging.kafka.bootstrap_servers '{}' is unresolved",
                        kafka.bootstrap_servers
                    ));
                    prepared.kafka.bootstrap_servers = defaults.kafka.bootstrap_servers.clone();
                }
                if kafka.enable_sasl {
                    let username = kafka.sasl_username.as_deref().unwrap_or("");
                    if is_placeholder(username) {
                        issues.push("messaging.kafka.sasl_username is unresolved".to_string());
                    }
                    if kafka.sasl_password.as_deref().map(is_placeholder).unwrap_or(false) {
                        issues.push("messaging.kafka.sasl_password is unresolved".to_string());
                    }
                }
            }
        }
    }

    if resolution.environment == Environment::Production && config.enabled && !issues.is_empty() {
        return Err(MessagingError::ConfigurationError(format!(
            "production messaging configuration is incomplete: {}",
            issues.join("; ")
        )));
    }

    for issue in &issues {
        warn!(environment = %resolution.environment, "{}", issue);
    }
    if let Some(gap) = &resolution.gap {
        error!(environment = %resolution.environment, gap = %gap, "Transport resolution gap");
    }

    Ok(PreparedTransport {
        resolution,
        config: prepared,
        warnings: issues,
    })
}

/// Validate without building anything, returning the warnings that would be logged
pub fn validate_transport_config(
    config: &MessagingConfig,
    environment: &Environment,
) -> MessagingResult<Vec<String>> {
    prepare_transport(config, environment).map(|prepared| prepared.warnings)
}

/// Builds one concrete implementation of `T` per transport mode
#[async_trait]
pub trait TransportBuilder<T: ?Sized + Send + Sync>: Send + Sync {
    async fn local_broker(&self, prepared: &PreparedTransport) -> MessagingResult<Arc<T>>;

    async fn managed_cloud_broker(&self, prepared: &PreparedTransport) -> MessagingResult<Arc<T>>;

    fn disabled(&self, prepared: &PreparedTransport) -> Arc<T>;
}

/// Resolve the transport once and build the matching implementation
pub async fn build_for_environment<T, B>(
    config: &MessagingConfig,
    environment: &Environment,
    builder: &B,
) -> MessagingResult<(Arc<T>, PreparedTransport)>
where
    T: ?Sized + Send + Sync,
    B: TransportBuilder<T>,
{
    let prepared = prepare_transport(config, environment)?;

    info!(
        environment = %prepared.resolution.environment,
        transport = %prepared.resolution.mode,
        enabled = config.enabled,
        "Resolved messaging transport"
    );

    let component = build_prepared(&prepared, builder).await?;
    Ok((component, prepared))
}

/// Build the implementation for an already prepared transport
pub async fn build_prepared<T, B>(prepared: &PreparedTransport, builder: &B) -> MessagingResult<Arc<T>>
where
    T: ?Sized + Send + Sync,
    B: TransportBuilder<T>,
{
    match prepared.resolution.mode {
        TransportMode::LocalBroker => builder.local_broker(prepared).await,
        TransportMode::ManagedCloudBroker => builder.managed_cloud_broker(prepared).await,
        TransportMode::Disabled => Ok(builder.disabled(prepared)),
    }
}

/// Builds message bus implementations
#[derive(Clone, Default)]
pub struct MessageBusBuilder {
    credentials: Option<CredentialCache>,
}

impl MessageBusBuilder {
    pub fn new(credentials: Option<CredentialCache>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl TransportBuilder<dyn MessageBus> for MessageBusBuilder {
    async fn local_broker(&self, prepared: &PreparedTransport) -> MessagingResult<Arc<dyn MessageBus>> {
        Ok(Arc::new(NatsMessageBus::new(prepared.config.clone()).await?))
    }

    async fn managed_cloud_broker(&self, prepared: &PreparedTransport) -> MessagingResult<Arc<dyn MessageBus>> {
        Ok(Arc::new(
            KafkaMessageBus::new(prepared.config.clone(), self.credentials.clone()).await?,
        ))
    }

    fn disabled(&self, _prepared: &PreparedTransport) -> Arc<dyn MessageBus> {
        Arc::new(NoopMessageBus::new().with_logging(true))
    }
}

/// Create the message bus for this process
pub async fn create_message_bus(
    config: &MessagingConfig,
    environment: &Environment,
    credentials: Option<CredentialCache>,
) -> MessagingResult<Arc<dyn MessageBus>> {
    let (bus, _) = build_for_environment(config, environment, &MessageBusBuilder::new(credentials)).await?;
    Ok(bus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_table() {
        let cases = [
            (false, Environment::Development, TransportMode::Disabled),
            (false, Environment::Production, TransportMode::Disabled),
            (false, Environment::Testing, TransportMode::Disabled),
            (false, Environment::Other("qa".into()), TransportMode::Disabled),
            (true, Environment::Development, TransportMode::LocalBroker),
            (true, Environment::Production, TransportMode::ManagedCloudBroker),
            (true, Environment::Testing, TransportMode::Disabled),
        ];

        for (enabled, env, expected) in cases {
            let resolution = resolve_transport_mode(enabled, &env);
            assert_eq!(resolution.mode, expected, "enabled={} env={}", enabled, env);
            assert!(resolution.gap.is_none());
        }
    }

    #[test]
    fn test_unknown_environment_reports_gap() {
        let resolution = resolve_transport_mode(true, &Environment::Other("staging".into()));
        assert_eq!(resolution.mode, TransportMode::Disabled);
        assert!(resolution.gap.unwrap().contains("staging"));
    }

    #[test]
    fn test_production_placeholder_is_fatal() {
        let mut config = MessagingConfig::default();
        config.kafka.bootstrap_servers = "${KAFKA_BOOTSTRAP_SERVERS}".to_string();

        let err = prepare_transport(&config, &Environment::Production).unwrap_err();
        assert!(matches!(err, MessagingError::ConfigurationError(_)));
    }

    #[test]
    fn test_production_missing_topic_is_fatal() {
        let mut config = MessagingConfig::default();
        config.kafka.bootstrap_servers = "broker-1.prod.internal:9093".to_string();
        config.default_topic = String::new();

        assert!(prepare_transport(&config, &Environment::Production).is_err());
    }

    #[test]
    fn test_production_disabled_skips_checks() {
        let mut config = MessagingConfig::default();
        config.enabled = false;
        config.kafka.bootstrap_servers = String::new();

        let prepared = prepare_transport(&config, &Environment::Production).unwrap();
        assert_eq!(prepared.resolution.mode, TransportMode::Disabled);
        assert!(prepared.warnings.is_empty());
    }

    #[test]
    fn test_development_placeholder_degrades_to_default() {
        let mut config = MessagingConfig::default();
        config.nats.servers = vec!["<nats-url>".to_string()];
        config.default_topic = "changeme".to_string();

        let prepared = prepare_transport(&config, &Environment::Development).unwrap();
        assert_eq!(prepared.resolution.mode, TransportMode::LocalBroker);
        assert_eq!(prepared.config.nats.servers, vec![DEFAULT_NATS_SERVER.to_string()]);
        assert_eq!(prepared.config.default_topic, "integration-events");
        assert_eq!(prepared.warnings.len(), 2);
    }

    #[test]
    fn test_testing_placeholder_is_warning() {
        let mut config = MessagingConfig::default();
        config.kafka.bootstrap_servers = String::new();

        let prepared = prepare_transport(&config, &Environment::Testing).unwrap();
        assert_eq!(prepared.resolution.mode, TransportMode::Disabled);
        assert_eq!(prepared.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_bus_is_noop() {
        let config = MessagingConfig {
            enabled: false,
            ..Default::default()
        };
        let bus = create_message_bus(&config, &Environment::Production, None).await.unwrap();
        assert_eq!(bus.transport(), TransportMode::Disabled);
    }

    #[tokio::test]
    async fn test_production_placeholder_blocks_bus_creation() {
        let mut config = MessagingConfig::default();
        config.kafka.bootstrap_servers = "your-namespace.servicebus.windows.net:9093".to_string();

        let result = create_message_bus(&config, &Environment::Production, None).await;
        assert!(matches!(result, Err(MessagingError::ConfigurationError(_))));
    }
}
