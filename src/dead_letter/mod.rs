//! Dead letter quarantine for messages that exhausted their retries
//!
//! A message that fails permanently, or fails transiently more often than the
//! retry policy allows, is copied into a [`DeadLetterRecord`] and written to
//! the transport's native dead letter location:
//!
//! ```text
//!  local broker (NATS)      JetStream stream `DEAD_LETTERS`, subject `<prefix>.dlq.<source>`, max_age = TTL
//!  managed cloud (Kafka)    topic `<prefix>.<source>.dlq`, retention.ms = TTL
//!  disabled                 logged and dropped
//! ```
//!
//! Records are never mutated after they are written; the store's own expiry
//! reclaims them.

mod factory;
mod kafka;
mod nats;
mod noop;
mod notifier;

pub use factory::{create_dead_letter_service, DeadLetterServiceBuilder};
pub use kafka::KafkaDeadLetterService;
pub use nats::NatsDeadLetterService;
pub use noop::NoopDeadLetterService;
pub use notifier::{AdminNotifier, LoggingAdminNotifier};

use crate::messaging::{MessageEnvelope, MessagingError, MessagingResult, TransportMode, MESSAGING_METRICS};
use crate::retry::RetryPolicyConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// Why a message was quarantined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Stable error kind, see [`MessagingError::kind`]
    pub kind: String,
    pub message: String,
    pub transient: bool,
}

impl From<&MessagingError> for FailureReason {
    fn from(err: &MessagingError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            transient: err.is_transient(),
        }
    }
}

/// A quarantined message together with its failure history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub envelope: MessageEnvelope,
    pub failure_reason: FailureReason,
    pub attempt_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Where the record was written, e.g. a subject or topic name
    pub dead_letter_location: String,
}

impl DeadLetterRecord {
    pub fn new(
        envelope: &MessageEnvelope,
        failure: &MessagingError,
        attempt_count: u32,
        config: &RetryPolicyConfig,
        location: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let expires_at = i64::try_from(config.dead_letter_ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut envelope = envelope.clone();
        envelope.attempt_count = attempt_count;

        Self {
            id: envelope.message_id.clone(),
            first_seen_at: envelope.created_at,
            envelope,
            failure_reason: FailureReason::from(failure),
            attempt_count,
            last_attempt_at: now,
            expires_at,
            dead_letter_location: location.into(),
        }
    }

    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn source(&self) -> &str {
        &self.envelope.source
    }
}

/// Quarantines messages at the transport's native dead letter location
#[async_trait]
pub trait DeadLetterService: Send + Sync {
    /// Write exactly one record for a terminally failed message
    async fn send_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        failure: &MessagingError,
        attempt_count: u32,
    ) -> MessagingResult<DeadLetterRecord>;

    /// Idempotently create the dead letter stream or topic
    async fn ensure_infrastructure(&self) -> MessagingResult<()>;

    /// Transport backing this service
    fn transport(&self) -> TransportMode;
}

/// Subject-safe form of a source name
pub(crate) fn sanitize_source(source: &str) -> String {
    if source.is_empty() {
        return "unknown".to_string();
    }
    source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Bookkeeping shared by every variant once a record has been written
pub(crate) async fn after_quarantine(
    record: &DeadLetterRecord,
    config: &RetryPolicyConfig,
    notifier: Option<&Arc<dyn AdminNotifier>>,
) {
    MESSAGING_METRICS
        .messages_dead_lettered
        .with_label_values(&[record.source(), &record.failure_reason.kind])
        .inc();

    warn!(
        message_id = %record.id,
        source = %record.source(),
        payload_type = %record.envelope.payload_type,
        attempts = record.attempt_count,
        reason = %record.failure_reason.kind,
        location = %record.dead_letter_location,
        expires_at = %record.expires_at,
        "Message quarantined"
    );

    if config.enable_admin_notifications {
        if let Some(notifier) = notifier {
            if let Err(e) = notifier.notify_dead_lettered(record).await {
                error!(message_id = %record.id, error = %e, "Admin notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_captures_failure() {
        let config = RetryPolicyConfig {
            dead_letter_ttl_hours: 48,
            ..Default::default()
        };
        let envelope = MessageEnvelope::new("OrderPlaced", serde_json::json!({"id": 1})).with_source("orders");
        let err = MessagingError::Timeout("broker".into());

        let record = DeadLetterRecord::new(&envelope, &err, 3, &config, "app.dlq.orders");

        assert_eq!(record.id, envelope.message_id);
        assert_eq!(record.attempt_count, 3);
        assert_eq!(record.envelope.attempt_count, 3);
        assert_eq!(record.failure_reason.kind, "timeout");
        assert!(record.failure_reason.transient);
        assert_eq!(record.first_seen_at, envelope.created_at);
        assert_eq!(record.expires_at - record.last_attempt_at, chrono::Duration::hours(48));
        assert_eq!(record.source(), "orders");
    }

    #[test]
    fn test_unbounded_ttl_saturates_expiry() {
        let config = RetryPolicyConfig {
            dead_letter_ttl_hours: u64::MAX,
            ..Default::default()
        };
        let envelope = MessageEnvelope::new("OrderPlaced", serde_json::json!({}));
        let record = DeadLetterRecord::new(&envelope, &MessagingError::Cancelled, 1, &config, "app.dlq.orders");
        assert_eq!(record.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_sanitize_source() {
        assert_eq!(sanitize_source("orders"), "orders");
        assert_eq!(sanitize_source("app.orders.v2"), "app-orders-v2");
        assert_eq!(sanitize_source("a b>c*"), "a-b-c-");
        assert_eq!(sanitize_source(""), "unknown");
    }
}
