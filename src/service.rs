//! Messaging service facade
//!
//! Owns the transport picked at startup together with the retry policy, the
//! dead letter service, the per-handler retry middleware and the event type
//! registry. Hosts construct it once, run [`MessagingService::ensure_infrastructure`]
//! and [`MessagingService::validate_configuration`], then share it.

use crate::config::AppConfig;
use crate::dead_letter::{AdminNotifier, DeadLetterService, DeadLetterServiceBuilder, LoggingAdminNotifier};
use crate::event_registry::{EventModule, EventTypeRegistry};
use crate::messaging::kafka::max_poll_interval_for;
use crate::messaging::{
    build_prepared, cancel_pair, prepare_transport, CancelSignal, CancelTrigger, CredentialCache, EnvelopeHandler,
    IntegrationEvent, MessageBus, MessageBusBuilder, MessageEnvelope, MessagingConfig, MessagingError, MessagingResult,
    PreparedTransport, SubscriptionHandle, TransportMode, TransportResolution,
};
use crate::retry::{DeliveryOutcome, MessageHandler, PolicySelfCheck, RetryMiddlewareFactory, RetryPolicy};
use std::sync::Arc;
use tracing::{info, warn};
use validator::Validate;

/// Entry point for application code that sends, publishes and consumes messages
pub struct MessagingService {
    config: AppConfig,
    transport: PreparedTransport,
    bus: Arc<dyn MessageBus>,
    dead_letters: Arc<dyn DeadLetterService>,
    policy: Arc<RetryPolicy>,
    middleware: RetryMiddlewareFactory,
    registry: Arc<EventTypeRegistry>,
    shutdown: CancelTrigger,
}

impl MessagingService {
    /// Resolve the transport from `config` and build every component
    pub async fn new(config: AppConfig) -> MessagingResult<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: AppConfig) -> MessagingServiceBuilder {
        MessagingServiceBuilder::new(config)
    }

    /// Send a command to a queue, or the default queue. Returns the message id.
    pub async fn send<T: IntegrationEvent>(&self, message: &T, destination: Option<&str>) -> MessagingResult<String> {
        let queue = self.transport.config.queue_or_default(destination).to_string();
        let envelope = MessageEnvelope::for_payload(message)?.with_source(self.transport.config.full_topic(&queue));
        let message_id = envelope.message_id.clone();
        self.bus.send(envelope, Some(&queue)).await?;
        Ok(message_id)
    }

    /// Publish an event to a topic, or the default topic. Returns the message id.
    pub async fn publish<T: IntegrationEvent>(&self, event: &T, topic: Option<&str>) -> MessagingResult<String> {
        let topic = self.transport.config.topic_or_default(topic).to_string();
        let envelope = MessageEnvelope::for_payload(event)?.with_source(self.transport.config.full_topic(&topic));
        let message_id = envelope.message_id.clone();
        self.bus.publish(envelope, Some(&topic)).await?;
        Ok(message_id)
    }

    /// Consume the default topic without retry handling
    pub async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        self.bus.subscribe(handler, subscription_name).await
    }

    /// Consume `M` events from the default topic through the retry middleware
    pub async fn subscribe_with_retry<M, H>(
        &self,
        handler: Arc<H>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle>
    where
        M: IntegrationEvent + Clone,
        H: MessageHandler<M>,
    {
        let source = self.transport.config.full_topic(&self.transport.config.default_topic);
        let adapter = self
            .middleware
            .get_or_create::<M, H>(&source)
            .into_envelope_handler(handler, self.shutdown.signal());
        self.bus.subscribe(adapter, subscription_name).await
    }

    /// Consume `M` commands from `queue` through the retry middleware
    pub async fn subscribe_queue_with_retry<M, H>(
        &self,
        queue: &str,
        handler: Arc<H>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle>
    where
        M: IntegrationEvent + Clone,
        H: MessageHandler<M>,
    {
        let source = self.transport.config.full_topic(queue);
        let adapter = self
            .middleware
            .get_or_create::<M, H>(&source)
            .into_envelope_handler(handler, self.shutdown.signal());
        self.bus.subscribe_queue(queue, adapter, subscription_name).await
    }

    /// Run one message through the retry middleware for `(M, H, source)`
    pub async fn execute_with_retry<M, H>(
        &self,
        envelope: MessageEnvelope,
        handler: &H,
        source: &str,
        cancel: &CancelSignal,
    ) -> MessagingResult<DeliveryOutcome>
    where
        M: IntegrationEvent + Clone,
        H: MessageHandler<M>,
    {
        self.middleware
            .get_or_create::<M, H>(source)
            .execute_with_retry(envelope, handler, cancel)
            .await
    }

    /// Idempotently create queues, topics and dead letter locations
    pub async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        self.bus.ensure_infrastructure().await?;
        self.dead_letters.ensure_infrastructure().await?;
        info!(transport = %self.transport_mode(), "Messaging infrastructure ready");
        Ok(())
    }

    /// Smoke test of the retry policy wiring
    pub fn validate_configuration(&self) -> PolicySelfCheck {
        self.policy.self_check()
    }

    /// Stop retry loops started by this service and close the bus
    pub async fn close(&self) -> MessagingResult<()> {
        self.shutdown.cancel();
        self.bus.close().await
    }

    pub fn event_registry(&self) -> &Arc<EventTypeRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn dead_letter_service(&self) -> &Arc<dyn DeadLetterService> {
        &self.dead_letters
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }

    pub fn resolution(&self) -> &TransportResolution {
        &self.transport.resolution
    }

    /// Warnings raised while validating the transport configuration
    pub fn warnings(&self) -> &[String] {
        &self.transport.warnings
    }

    pub fn transport_mode(&self) -> TransportMode {
        self.transport.resolution.mode
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Messaging settings in effect, after defaults were substituted and the
    /// Kafka poll interval was widened to fit the retry policy
    pub fn transport_config(&self) -> &MessagingConfig {
        &self.transport.config
    }

    /// Signal cancelled by [`close`](Self::close)
    pub fn shutdown_signal(&self) -> CancelSignal {
        self.shutdown.signal()
    }
}

/// Builder for [`MessagingService`] that allows replacing resolved components
pub struct MessagingServiceBuilder {
    config: AppConfig,
    bus: Option<Arc<dyn MessageBus>>,
    dead_letters: Option<Arc<dyn DeadLetterService>>,
    notifier: Option<Arc<dyn AdminNotifier>>,
    credentials: Option<CredentialCache>,
    modules: Vec<Arc<dyn EventModule>>,
}

impl MessagingServiceBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            bus: None,
            dead_letters: None,
            notifier: None,
            credentials: None,
            modules: Vec::new(),
        }
    }

    /// Use this bus instead of the resolved one
    pub fn with_message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Use this dead letter service instead of the resolved one
    pub fn with_dead_letter_service(mut self, service: Arc<dyn DeadLetterService>) -> Self {
        self.dead_letters = Some(service);
        self
    }

    pub fn with_admin_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Credential source for the managed broker's SASL password
    pub fn with_credentials(mut self, credentials: CredentialCache) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_event_module(mut self, module: Arc<dyn EventModule>) -> Self {
        self.modules.push(module);
        self
    }

    pub async fn build(self) -> MessagingResult<MessagingService> {
        self.config
            .dead_letter
            .validate()
            .map_err(|e| MessagingError::ConfigurationError(format!("invalid dead_letter settings: {}", e)))?;

        // Runs even when components are injected so production misconfiguration still fails fast
        let mut transport = prepare_transport(&self.config.messaging, &self.config.environment)?;
        let policy = Arc::new(RetryPolicy::new(self.config.dead_letter.clone()));

        // Retries wait inside the consumer loop, so the group must tolerate a full backoff cycle between polls
        let kafka = &mut transport.config.kafka;
        kafka.max_poll_interval_ms = max_poll_interval_for(kafka.max_poll_interval_ms, policy.total_backoff());
        info!(
            environment = %transport.resolution.environment,
            transport = %transport.resolution.mode,
            enabled = self.config.messaging.enabled,
            "Resolved messaging transport"
        );

        let bus = match self.bus {
            Some(bus) => {
                info!(transport = %bus.transport(), "Using injected message bus");
                bus
            }
            None => build_prepared(&transport, &MessageBusBuilder::new(self.credentials.clone())).await?,
        };

        let notifier = match self.notifier {
            Some(notifier) => Some(notifier),
            None if self.config.dead_letter.enable_admin_notifications => {
                Some(Arc::new(LoggingAdminNotifier) as Arc<dyn AdminNotifier>)
            }
            None => None,
        };

        let dead_letters = match self.dead_letters {
            Some(service) => service,
            None => {
                let builder = DeadLetterServiceBuilder::new(self.config.dead_letter.clone())
                    .with_notifier(notifier)
                    .with_credentials(self.credentials);
                build_prepared(&transport, &builder).await?
            }
        };

        if bus.transport() != dead_letters.transport() {
            warn!(
                bus = %bus.transport(),
                dead_letters = %dead_letters.transport(),
                "Message bus and dead letter service use different transports"
            );
        }

        let middleware = RetryMiddlewareFactory::new(policy.clone(), dead_letters.clone());
        let registry = Arc::new(EventTypeRegistry::with_modules(
            self.modules,
            self.config.event_registry.cache_ttl(),
        ));
        let (shutdown, _) = cancel_pair();

        Ok(MessagingService {
            config: self.config,
            transport,
            bus,
            dead_letters,
            policy,
            middleware,
            registry,
            shutdown,
        })
    }
}
