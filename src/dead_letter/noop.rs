//! Dead letter service that logs and drops

use crate::dead_letter::{after_quarantine, AdminNotifier, DeadLetterRecord, DeadLetterService};
use crate::messaging::{MessageEnvelope, MessagingError, MessagingResult, TransportMode};
use crate::retry::RetryPolicyConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// Location reported for records that were not stored anywhere
pub const DISCARDED_LOCATION: &str = "discarded";

/// Dead letter service used when messaging is disabled
pub struct NoopDeadLetterService {
    config: RetryPolicyConfig,
    notifier: Option<Arc<dyn AdminNotifier>>,
}

impl NoopDeadLetterService {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config, notifier: None }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn AdminNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

#[async_trait]
impl DeadLetterService for NoopDeadLetterService {
    async fn send_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        failure: &MessagingError,
        attempt_count: u32,
    ) -> MessagingResult<DeadLetterRecord> {
        let record = DeadLetterRecord::new(envelope, failure, attempt_count, &self.config, DISCARDED_LOCATION);
        after_quarantine(&record, &self.config, self.notifier.as_ref()).await;
        Ok(record)
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        Ok(())
    }

    fn transport(&self) -> TransportMode {
        TransportMode::Disabled
    }
}
