//! NATS message bus, the local broker transport

use crate::messaging::config::{MessagingConfig, NatsConfig, TransportMode};
use crate::messaging::consumer::{dispatch_until_settled, Disposition};
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::error::{MessagingError, MessagingResult};
use crate::messaging::metrics::{record_outbound, Outbound};
use crate::messaging::traits::{EnvelopeHandler, MessageBus, SubscriptionHandle};
use async_nats::connection::State;
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect to the NATS servers in `config`.
///
/// The connection is established in the background, so a broker that is not
/// up yet does not block startup; publishes fail until it is reachable.
pub async fn connect(config: &NatsConfig) -> MessagingResult<Client> {
    let mut options = async_nats::ConnectOptions::new()
        .name(&config.connection_name)
        .request_timeout(Some(Duration::from_millis(config.request_timeout_ms)))
        .ping_interval(Duration::from_secs(config.ping_interval_secs))
        .retry_on_initial_connect();

    if let Some(token) = &config.token {
        options = options.token(token.clone());
    }

    options
        .connect(server_list(config).as_str())
        .await
        .map_err(|e| MessagingError::ConnectionFailed(format!("NATS connection failed: {}", e)))
}

/// Servers as the comma-separated address list the client parses
fn server_list(config: &NatsConfig) -> String {
    config
        .servers
        .iter()
        .map(|server| server.trim())
        .filter(|server| !server.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Message bus over core NATS subjects
pub struct NatsMessageBus {
    client: Arc<Client>,
    config: MessagingConfig,
}

impl NatsMessageBus {
    /// Create a new NATS message bus
    pub async fn new(config: MessagingConfig) -> MessagingResult<Self> {
        let client = connect(&config.nats).await?;
        info!(servers = ?config.nats.servers, "NATS message bus created");

        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    /// Create a bus over an existing client
    pub fn with_client(client: Client, config: MessagingConfig) -> Self {
        Self {
            client: Arc::new(client),
            config,
        }
    }

    async fn publish_to(&self, subject: String, envelope: &MessageEnvelope) -> MessagingResult<()> {
        let payload = envelope.to_bytes()?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| MessagingError::PublishFailed(format!("NATS publish to '{}' failed: {}", subject, e)))?;

        debug!(
            message_id = %envelope.message_id,
            subject = %subject,
            "Message published to NATS"
        );
        Ok(())
    }

    async fn consume(
        &self,
        subject: String,
        group: String,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> MessagingResult<SubscriptionHandle> {
        let mut subscriber = self
            .client
            .queue_subscribe(subject.clone(), group.clone())
            .await
            .map_err(|e| MessagingError::SubscribeFailed(format!("NATS subscribe failed: {}", e)))?;

        info!(subject = %subject, group = %group, "NATS subscription started");

        let source = subject.clone();
        Ok(SubscriptionHandle::spawn(group, move |signal| async move {
            loop {
                let message = tokio::select! {
                    _ = signal.cancelled() => break,
                    next = subscriber.next() => match next {
                        Some(message) => message,
                        None => {
                            warn!(subject = %source, "NATS subscription closed by server");
                            return;
                        }
                    },
                };

                // Core NATS never redelivers, so a failed message is held and retried here
                let disposition = dispatch_until_settled(
                    &handler,
                    &message.payload,
                    &source,
                    TransportMode::LocalBroker,
                    &signal,
                )
                .await;
                if disposition == Disposition::Abandon {
                    break;
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                warn!(subject = %source, error = %e, "NATS unsubscribe failed");
            }
        }))
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn send(&self, envelope: MessageEnvelope, destination: Option<&str>) -> MessagingResult<()> {
        let queue = self.config.queue_or_default(destination);
        let result = self.publish_to(self.config.full_topic(queue), &envelope).await;
        record_outbound(Outbound::Send, queue, TransportMode::LocalBroker, &result);
        result
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: Option<&str>) -> MessagingResult<()> {
        let topic = self.config.topic_or_default(topic);
        let result = self.publish_to(self.config.full_topic(topic), &envelope).await;
        record_outbound(Outbound::Publish, topic, TransportMode::LocalBroker, &result);
        result
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        let subject = self.config.full_topic(&self.config.default_topic);
        let group = self.config.subscription_or_default(subscription_name).to_string();
        self.consume(subject, group, handler).await
    }

    async fn subscribe_queue(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        let subject = self.config.full_topic(queue);
        let group = subscription_name.unwrap_or(queue).to_string();
        self.consume(subject, group, handler).await
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        // Core subjects need no provisioning
        debug!("NATS subjects are created on first use");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    async fn close(&self) -> MessagingResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| MessagingError::ConnectionFailed(format!("NATS flush failed: {}", e)))
    }

    fn transport(&self) -> TransportMode {
        TransportMode::LocalBroker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nats_config() {
        let config = NatsConfig::default();
        assert!(!config.servers.is_empty());
        assert_eq!(config.connection_name, "reliable-messaging");
        assert_eq!(config.dead_letter_stream, "DEAD_LETTERS");
    }

    #[test]
    fn test_server_list_is_comma_separated() {
        let config = NatsConfig {
            servers: vec![
                "nats://a:4222".to_string(),
                " nats://b:4222 ".to_string(),
                String::new(),
            ],
            ..Default::default()
        };
        assert_eq!(server_list(&config), "nats://a:4222,nats://b:4222");

        let addrs: Vec<async_nats::ServerAddr> = async_nats::ToServerAddrs::to_server_addrs(server_list(&config).as_str())
            .unwrap()
            .collect();
        assert_eq!(addrs.len(), 2);
    }
}
