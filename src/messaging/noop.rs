//! Message bus that accepts every call and performs no transport I/O

use crate::messaging::config::TransportMode;
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::error::MessagingResult;
use crate::messaging::traits::{EnvelopeHandler, MessageBus, SubscriptionHandle};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// No-op message bus used when messaging is disabled
#[derive(Debug, Clone, Default)]
pub struct NoopMessageBus {
    log_calls: bool,
}

impl NoopMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every swallowed call at debug level
    pub fn with_logging(mut self, log_calls: bool) -> Self {
        self.log_calls = log_calls;
        self
    }
}

#[async_trait]
impl MessageBus for NoopMessageBus {
    async fn send(&self, envelope: MessageEnvelope, destination: Option<&str>) -> MessagingResult<()> {
        if self.log_calls {
            debug!(
                message_id = %envelope.message_id,
                payload_type = %envelope.payload_type,
                destination = ?destination,
                "Messaging disabled, dropping send"
            );
        }
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: Option<&str>) -> MessagingResult<()> {
        if self.log_calls {
            debug!(
                message_id = %envelope.message_id,
                payload_type = %envelope.payload_type,
                topic = ?topic,
                "Messaging disabled, dropping publish"
            );
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        let name = subscription_name.unwrap_or("noop");
        if self.log_calls {
            debug!(subscription = %name, "Messaging disabled, subscription is inert");
        }
        Ok(SubscriptionHandle::inert(name))
    }

    async fn subscribe_queue(
        &self,
        queue: &str,
        _handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        let name = subscription_name.unwrap_or(queue);
        if self.log_calls {
            debug!(queue = %queue, subscription = %name, "Messaging disabled, queue subscription is inert");
        }
        Ok(SubscriptionHandle::inert(name))
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        false
    }

    async fn close(&self) -> MessagingResult<()> {
        Ok(())
    }

    fn transport(&self) -> TransportMode {
        TransportMode::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::error::MessagingError;
    use crate::messaging::traits::envelope_handler_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_noop_bus_accepts_everything() {
        let bus = NoopMessageBus::new().with_logging(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = envelope_handler_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(MessagingError::HandlerFailed("must never run".into()))
            }
        });

        let envelope = MessageEnvelope::new("Anything", serde_json::json!({"x": 1}));
        assert!(bus.send(envelope.clone(), None).await.is_ok());
        assert!(bus.send(envelope.clone(), Some("billing")).await.is_ok());
        assert!(bus.publish(envelope, Some("")).await.is_ok());

        let handle = bus.subscribe(handler.clone(), None).await.unwrap();
        assert!(!handle.is_active());
        let handle = bus.subscribe_queue("q", handler, Some("workers")).await.unwrap();
        assert_eq!(handle.name(), "workers");

        assert!(bus.ensure_infrastructure().await.is_ok());
        assert!(!bus.is_connected().await);
        assert_eq!(bus.transport(), TransportMode::Disabled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
