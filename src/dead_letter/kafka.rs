//! Dead letters on per-source Kafka topics

use crate::dead_letter::{after_quarantine, sanitize_source, AdminNotifier, DeadLetterRecord, DeadLetterService};
use crate::messaging::kafka::{create_topics, RefreshingProducer};
use crate::messaging::{
    CredentialCache, MessageEnvelope, MessagingConfig, MessagingError, MessagingResult, TransportMode,
};
use crate::retry::RetryPolicyConfig;
use async_trait::async_trait;
use dashmap::DashSet;
use rdkafka::admin::{AdminClient, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::message::{Header, OwnedHeaders};
use std::sync::Arc;
use tracing::debug;

/// Dead letter service writing to `<prefix>.<source>.dlq` topics whose
/// retention is the configured TTL
pub struct KafkaDeadLetterService {
    producer: RefreshingProducer,
    messaging: MessagingConfig,
    config: RetryPolicyConfig,
    notifier: Option<Arc<dyn AdminNotifier>>,
    provisioned: DashSet<String>,
}

impl KafkaDeadLetterService {
    pub async fn new(
        messaging: MessagingConfig,
        config: RetryPolicyConfig,
        credentials: Option<CredentialCache>,
    ) -> MessagingResult<Self> {
        let settings = vec![
            ("message.timeout.ms", messaging.kafka.message_timeout_ms.to_string()),
            ("enable.idempotence", "true".to_string()),
        ];
        let producer = RefreshingProducer::new(messaging.kafka.clone(), settings, credentials).await?;

        Ok(Self {
            producer,
            messaging,
            config,
            notifier: None,
            provisioned: DashSet::new(),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        if self.provisioned.contains(topic) {
            return Ok(());
        }

        let retention_ms = self.config.dead_letter_ttl().as_millis().to_string();
        let new_topic = NewTopic::new(
            topic,
            self.messaging.kafka.partitions,
            TopicReplication::Fixed(self.messaging.kafka.replication_factor),
        )
        .set("retention.ms", &retention_ms)
        .set("cleanup.policy", "delete");

        let admin: AdminClient<DefaultClientContext> = self
            .producer
            .client_config()
            .create()
            .map_err(|e| MessagingError::ConnectionFailed(format!("Kafka admin client creation failed: {}", e)))?;

        create_topics(&admin, &[new_topic]).await?;
        self.provisioned.insert(topic.to_string());
        Ok(())
    }
}

/// Dead letter topic for messages from `source`
pub fn dead_letter_topic(messaging: &MessagingConfig, source: &str) -> String {
    let source = source
        .strip_prefix(&format!("{}.", messaging.topic_prefix))
        .unwrap_or(source);
    messaging.full_topic(&format!("{}.dlq", sanitize_source(source)))
}

#[async_trait]
impl DeadLetterService for KafkaDeadLetterService {
    async fn send_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        failure: &MessagingError,
        attempt_count: u32,
    ) -> MessagingResult<DeadLetterRecord> {
        let topic = dead_letter_topic(&self.messaging, &envelope.source);
        self.ensure_topic(&topic).await?;

        let record = DeadLetterRecord::new(envelope, failure, attempt_count, &self.config, topic.clone());
        let payload = record.to_bytes()?;
        let attempts = attempt_count.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "dead_letter_reason",
                value: Some(record.failure_reason.kind.as_str()),
            })
            .insert(Header {
                key: "dead_letter_attempts",
                value: Some(attempts.as_str()),
            })
            .insert(Header {
                key: "payload_type",
                value: Some(record.envelope.payload_type.as_str()),
            });

        let (partition, offset) = self
            .producer
            .send("Kafka dead letter write failed", &topic, &record.id, &payload, headers)
            .await
            .map_err(|e| MessagingError::DeadLetterFailed(e.to_string()))?;

        debug!(
            message_id = %record.id,
            topic = %topic,
            partition,
            offset,
            "Dead letter stored"
        );

        after_quarantine(&record, &self.config, self.notifier.as_ref()).await;
        Ok(record)
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        let sources = [
            self.messaging.default_queue.clone(),
            self.messaging.default_topic.clone(),
        ];
        for source in sources {
            self.ensure_topic(&dead_letter_topic(&self.messaging, &source)).await?;
        }
        Ok(())
    }

    fn transport(&self) -> TransportMode {
        TransportMode::ManagedCloudBroker
    }
}
