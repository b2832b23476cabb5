//! Dead letters on a NATS JetStream stream

use crate::dead_letter::{after_quarantine, sanitize_source, AdminNotifier, DeadLetterRecord, DeadLetterService};
use crate::messaging::{MessageEnvelope, MessagingConfig, MessagingError, MessagingResult, TransportMode};
use crate::retry::RetryPolicyConfig;
use async_nats::jetstream::{self, stream};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Dead letter service backed by a JetStream stream whose `max_age` is the TTL
pub struct NatsDeadLetterService {
    jetstream: jetstream::Context,
    messaging: MessagingConfig,
    config: RetryPolicyConfig,
    notifier: Option<Arc<dyn AdminNotifier>>,
}

impl NatsDeadLetterService {
    pub fn new(client: Client, messaging: MessagingConfig, config: RetryPolicyConfig) -> Self {
        Self {
            jetstream: jetstream::new(client),
            messaging,
            config,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Subject a record from `source` is written to
    pub fn subject_for(&self, source: &str) -> String {
        dead_letter_subject(&self.messaging, source)
    }
}

/// Subject under the dead letter stream for messages from `source`
pub fn dead_letter_subject(messaging: &MessagingConfig, source: &str) -> String {
    let source = source
        .strip_prefix(&format!("{}.", messaging.topic_prefix))
        .unwrap_or(source);
    messaging.full_topic(&format!("dlq.{}", sanitize_source(source)))
}

/// Stream definition holding every dead letter subject
pub fn dead_letter_stream_config(messaging: &MessagingConfig, config: &RetryPolicyConfig) -> stream::Config {
    stream::Config {
        name: messaging.nats.dead_letter_stream.clone(),
        subjects: vec![messaging.full_topic("dlq.>")],
        max_age: config.dead_letter_ttl(),
        storage: stream::StorageType::File,
        duplicate_window: Duration::from_secs(120),
        ..Default::default()
    }
}

#[async_trait]
impl DeadLetterService for NatsDeadLetterService {
    async fn send_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        failure: &MessagingError,
        attempt_count: u32,
    ) -> MessagingResult<DeadLetterRecord> {
        let subject = self.subject_for(&envelope.source);
        let record = DeadLetterRecord::new(envelope, failure, attempt_count, &self.config, subject.clone());
        let payload = record.to_bytes()?;

        // Server-side dedupe keeps a redelivered failure from creating a second record
        let mut headers = HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, record.id.as_str());
        headers.insert("Dead-Letter-Reason", record.failure_reason.kind.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| MessagingError::DeadLetterFailed(format!("JetStream publish to '{}' failed: {}", subject, e)))?
            .await
            .map_err(|e| MessagingError::DeadLetterFailed(format!("JetStream ack for '{}' failed: {}", subject, e)))?;

        debug!(
            message_id = %record.id,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Dead letter stored"
        );

        after_quarantine(&record, &self.config, self.notifier.as_ref()).await;
        Ok(record)
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        let config = dead_letter_stream_config(&self.messaging, &self.config);
        let name = config.name.clone();
        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| MessagingError::ConfigurationError(format!("failed to create stream '{}': {}", name, e)))?;

        info!(
            stream = %name,
            ttl_hours = self.config.dead_letter_ttl_hours,
            "JetStream dead letter stream ready"
        );
        Ok(())
    }

    fn transport(&self) -> TransportMode {
        TransportMode::LocalBroker
    }
}
