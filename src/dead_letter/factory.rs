//! Picks the dead letter implementation for the resolved transport

use crate::dead_letter::{
    AdminNotifier, DeadLetterService, KafkaDeadLetterService, NatsDeadLetterService, NoopDeadLetterService,
};
use crate::messaging::factory::{build_for_environment, PreparedTransport, TransportBuilder};
use crate::messaging::nats::connect;
use crate::messaging::{CredentialCache, Environment, MessagingConfig, MessagingResult};
use crate::retry::RetryPolicyConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// Builds dead letter services for each transport mode
pub struct DeadLetterServiceBuilder {
    policy: RetryPolicyConfig,
    notifier: Option<Arc<dyn AdminNotifier>>,
    credentials: Option<CredentialCache>,
}

impl DeadLetterServiceBuilder {
    pub fn new(policy: RetryPolicyConfig) -> Self {
        Self {
            policy,
            notifier: None,
            credentials: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn AdminNotifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<CredentialCache>) -> Self {
        self.credentials = credentials;
        self
    }
}

#[async_trait]
impl TransportBuilder<dyn DeadLetterService> for DeadLetterServiceBuilder {
    async fn local_broker(&self, prepared: &PreparedTransport) -> MessagingResult<Arc<dyn DeadLetterService>> {
        let client = connect(&prepared.config.nats).await?;
        let mut service = NatsDeadLetterService::new(client, prepared.config.clone(), self.policy.clone());
        if let Some(notifier) = &self.notifier {
            service = service.with_notifier(notifier.clone());
        }
        Ok(Arc::new(service))
    }

    async fn managed_cloud_broker(
        &self,
        prepared: &PreparedTransport,
    ) -> MessagingResult<Arc<dyn DeadLetterService>> {
        let mut service =
            KafkaDeadLetterService::new(prepared.config.clone(), self.policy.clone(), self.credentials.clone())
                .await?;
        if let Some(notifier) = &self.notifier {
            service = service.with_notifier(notifier.clone());
        }
        Ok(Arc::new(service))
    }

    fn disabled(&self, _prepared: &PreparedTransport) -> Arc<dyn DeadLetterService> {
        let mut service = NoopDeadLetterService::new(self.policy.clone());
        if let Some(notifier) = &self.notifier {
            service = service.with_notifier(notifier.clone());
        }
        Arc::new(service)
    }
}

/// Create the dead letter service matching the message bus for this process
pub async fn create_dead_letter_service(
    messaging: &MessagingConfig,
    environment: &Environment,
    policy: RetryPolicyConfig,
    notifier: Option<Arc<dyn AdminNotifier>>,
) -> MessagingResult<Arc<dyn DeadLetterService>> {
    let builder = DeadLetterServiceBuilder::new(policy).with_notifier(notifier);
    let (service, _) = build_for_environment(messaging, environment, &builder).await?;
    Ok(service)
}
