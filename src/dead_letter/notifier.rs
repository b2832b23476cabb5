//! Admin notification hook for quarantined messages

use crate::dead_letter::DeadLetterRecord;
use crate::messaging::MessagingResult;
use async_trait::async_trait;
use tracing::warn;

/// Hook for external alerting when a message is quarantined
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify_dead_lettered(&self, record: &DeadLetterRecord) -> MessagingResult<()>;
}

/// Notifier that only emits a log line, used when no alerting is wired in
#[derive(Debug, Clone, Default)]
pub struct LoggingAdminNotifier;

#[async_trait]
impl AdminNotifier for LoggingAdminNotifier {
    async fn notify_dead_lettered(&self, record: &DeadLetterRecord) -> MessagingResult<()> {
        warn!(
            target: "admin_notifications",
            message_id = %record.id,
            source = %record.source(),
            reason = %record.failure_reason.message,
            location = %record.dead_letter_location,
            "Dead letter requires operator attention"
        );
        Ok(())
    }
}
