//! Messaging trait abstractions

use crate::messaging::cancel::{cancel_pair, CancelSignal, CancelTrigger};
use crate::messaging::config::TransportMode;
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Consumer callback invoked by a subscription for every received envelope.
///
/// Returning `Ok` acknowledges the message; returning `Err` leaves it to the
/// transport's redelivery rules.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: MessageEnvelope) -> MessagingResult<()>;
}

/// Adapter turning an async closure into an [`EnvelopeHandler`]
pub struct EnvelopeHandlerFn<F> {
    f: F,
}

/// Wrap a closure as an [`EnvelopeHandler`]
pub fn envelope_handler_fn<F, Fut>(f: F) -> Arc<dyn EnvelopeHandler>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessagingResult<()>> + Send + 'static,
{
    Arc::new(EnvelopeHandlerFn { f })
}

#[async_trait]
impl<F, Fut> EnvelopeHandler for EnvelopeHandlerFn<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = MessagingResult<()>> + Send,
{
    async fn handle(&self, envelope: MessageEnvelope) -> MessagingResult<()> {
        (self.f)(envelope).await
    }
}

/// Message bus exposing point-to-point and fan-out delivery.
///
/// Implementations are shared behind an `Arc` by every caller and must be
/// safe for concurrent use without additional locking.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver a message to a named queue, or the default queue
    async fn send(&self, envelope: MessageEnvelope, destination: Option<&str>) -> MessagingResult<()>;

    /// Fan a message out to a named topic, or the default topic
    async fn publish(&self, envelope: MessageEnvelope, topic: Option<&str>) -> MessagingResult<()>;

    /// Register a long-lived consumer on the default topic
    async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle>;

    /// Register a competing consumer on a named queue
    async fn subscribe_queue(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle>;

    /// Idempotently create the queues and topics this bus relies on
    async fn ensure_infrastructure(&self) -> MessagingResult<()>;

    /// Check if the bus is connected
    async fn is_connected(&self) -> bool;

    /// Close the bus connection
    async fn close(&self) -> MessagingResult<()>;

    /// Transport backing this bus
    fn transport(&self) -> TransportMode;
}

/// Handle to a running consumer loop
#[derive(Debug)]
pub struct SubscriptionHandle {
    name: String,
    trigger: CancelTrigger,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Spawn a consumer loop. The closure receives the signal it must honor.
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (trigger, signal) = cancel_pair();
        let task = tokio::spawn(run(signal));
        Self {
            name: name.into(),
            trigger,
            task: Some(task),
        }
    }

    /// A handle with no consumer behind it
    pub fn inert(name: impl Into<String>) -> Self {
        let (trigger, _) = cancel_pair();
        Self {
            name: name.into(),
            trigger,
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a consumer task is attached
    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Ask the consumer loop to stop
    pub fn cancel(&self) {
        self.trigger.cancel();
    }

    /// Cancellation signal observed by the consumer loop
    pub fn signal(&self) -> CancelSignal {
        self.trigger.signal()
    }

    /// Stop the consumer loop and wait for it to finish
    pub async fn shutdown(mut self) -> MessagingResult<()> {
        self.trigger.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| {
                MessagingError::ConsumeFailed(format!("subscription '{}' task failed: {}", self.name, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_subscription_handle_shutdown_stops_loop() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let handle = SubscriptionHandle::spawn("orders", move |signal| async move {
            signal.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(handle.name(), "orders");
        handle.shutdown().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_inert_handle() {
        let handle = SubscriptionHandle::inert("disabled");
        assert!(!handle.is_active());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_envelope_handler_fn() {
        let handler = envelope_handler_fn(|envelope: MessageEnvelope| async move {
            if envelope.payload_type == "Bad" {
                Err(MessagingError::Validation("bad".into()))
            } else {
                Ok(())
            }
        });

        let ok = MessageEnvelope::new("Good", serde_json::Value::Null);
        let bad = MessageEnvelope::new("Bad", serde_json::Value::Null);
        assert!(handler.handle(ok).await.is_ok());
        assert!(handler.handle(bad).await.is_err());
    }
}
