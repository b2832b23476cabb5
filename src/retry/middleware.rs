//! Retry middleware: run a handler, back off on transient failures, quarantine
//! when the policy gives up
//!
//! ```text
//!            ┌──────────────┐  ok   ┌───────────┐
//!   start ──▶│  Attempting  │──────▶│ Delivered │
//!            └──────────────┘       └───────────┘
//!              ▲    │ err
//!     delay    │    ├── should_retry ──▶ Waiting ──┐
//!     elapsed  └────┼───────────────────────────────┘
//!                   └── give up ──▶ Quarantined
//! ```
//!
//! Cancellation leaves the machine from any state with `Err(Cancelled)`.

use crate::dead_letter::{DeadLetterService, FailureReason};
use crate::messaging::{
    CancelSignal, EnvelopeHandler, IntegrationEvent, MessageEnvelope, MessagingError, MessagingResult,
    MESSAGING_METRICS,
};
use crate::retry::policy::RetryPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-attempt information handed to a [`MessageHandler`]
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub source: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub cancel: CancelSignal,
}

/// Application handler for a decoded message of type `M`.
///
/// Return [`MessagingError::Cancelled`] to abort without retry or quarantine.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync + 'static {
    async fn handle(&self, message: M, context: HandlerContext) -> MessagingResult<()>;
}

/// Closure adapter, see [`handler_fn`]
pub struct HandlerFn<M, F> {
    f: F,
    _message: PhantomData<fn(M)>,
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<M, F, Fut>(f: F) -> HandlerFn<M, F>
where
    M: Send + 'static,
    F: Fn(M, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessagingResult<()>> + Send + 'static,
{
    HandlerFn {
        f,
        _message: PhantomData,
    }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for HandlerFn<M, F>
where
    M: Send + 'static,
    F: Fn(M, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MessagingResult<()>> + Send + 'static,
{
    async fn handle(&self, message: M, context: HandlerContext) -> MessagingResult<()> {
        (self.f)(message, context).await
    }
}

/// Terminal result of one `execute_with_retry` call
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
    },
    Quarantined {
        attempts: u32,
        reason: FailureReason,
        location: String,
    },
}

impl DeliveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts } | DeliveryOutcome::Quarantined { attempts, .. } => *attempts,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

enum RetryState {
    Attempting { attempt: u32 },
    Waiting { attempt: u32, delay: Duration },
    Delivered { attempts: u32 },
    Quarantined { attempts: u32, error: MessagingError },
}

/// Retry middleware for one (message type, handler type, source) triple
pub struct MessageRetryMiddleware<M, H> {
    source: String,
    policy: Arc<RetryPolicy>,
    dead_letters: Arc<dyn DeadLetterService>,
    _types: PhantomData<fn() -> (M, H)>,
}

impl<M, H> MessageRetryMiddleware<M, H>
where
    M: IntegrationEvent + Clone,
    H: MessageHandler<M>,
{
    pub fn new(source: impl Into<String>, policy: Arc<RetryPolicy>, dead_letters: Arc<dyn DeadLetterService>) -> Self {
        Self {
            source: source.into(),
            policy,
            dead_letters,
            _types: PhantomData,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Drive one message to a terminal outcome.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires during a handler call or a
    /// backoff wait, and `Err(DeadLetterFailed)` if quarantine itself fails.
    pub async fn execute_with_retry(
        &self,
        mut envelope: MessageEnvelope,
        handler: &H,
        cancel: &CancelSignal,
    ) -> MessagingResult<DeliveryOutcome> {
        if envelope.source.is_empty() {
            envelope.source = self.source.clone();
        }

        let message = match self.decode(&envelope) {
            Ok(message) => message,
            Err(e) => {
                envelope.attempt_count = 1;
                self.log_failure(&envelope, &e, 1);
                return self.quarantine(&envelope, e, 1).await;
            }
        };

        let mut state = RetryState::Attempting { attempt: 1 };
        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    if cancel.is_cancelled() {
                        return Err(self.cancelled(&envelope, attempt));
                    }
                    envelope.attempt_count = attempt;
                    MESSAGING_METRICS
                        .handler_attempts
                        .with_label_values(&[&self.source])
                        .inc();

                    let context = HandlerContext {
                        message_id: envelope.message_id.clone(),
                        correlation_id: envelope.correlation_id.clone(),
                        source: envelope.source.clone(),
                        attempt,
                        cancel: cancel.clone(),
                    };

                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(MessagingError::Cancelled),
                        result = handler.handle(message.clone(), context) => result,
                    };

                    match result {
                        Ok(()) => RetryState::Delivered { attempts: attempt },
                        Err(e) if e.is_cancellation() => return Err(self.cancelled(&envelope, attempt)),
                        Err(e) => {
                            self.log_failure(&envelope, &e, attempt);
                            if self.policy.should_retry(&e, attempt) {
                                RetryState::Waiting {
                                    attempt,
                                    delay: self.policy.calculate_retry_delay(attempt),
                                }
                            } else {
                                RetryState::Quarantined { attempts: attempt, error: e }
                            }
                        }
                    }
                }

                RetryState::Waiting { attempt, delay } => {
                    MESSAGING_METRICS
                        .retries_scheduled
                        .with_label_values(&[&self.source])
                        .inc();
                    MESSAGING_METRICS
                        .retry_delay
                        .with_label_values(&[&self.source])
                        .observe(delay.as_secs_f64());

                    if self.policy.config().enable_detailed_logging {
                        info!(
                            message_id = %envelope.message_id,
                            source = %envelope.source,
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "Retry scheduled"
                        );
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(self.cancelled(&envelope, attempt)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    RetryState::Attempting { attempt: attempt + 1 }
                }

                RetryState::Delivered { attempts } => {
                    MESSAGING_METRICS
                        .messages_delivered
                        .with_label_values(&[&self.source])
                        .inc();
                    debug!(
                        message_id = %envelope.message_id,
                        source = %envelope.source,
                        attempts,
                        "Message delivered"
                    );
                    return Ok(DeliveryOutcome::Delivered { attempts });
                }

                RetryState::Quarantined { attempts, error } => {
                    return self.quarantine(&envelope, error, attempts).await;
                }
            };
        }
    }

    /// Adapt this middleware and a handler into a subscription callback.
    ///
    /// Envelopes carrying another payload type are acknowledged and skipped.
    pub fn into_envelope_handler(self: Arc<Self>, handler: Arc<H>, cancel: CancelSignal) -> Arc<dyn EnvelopeHandler> {
        Arc::new(RetryingEnvelopeHandler {
            middleware: self,
            handler,
            cancel,
        })
    }

    fn decode(&self, envelope: &MessageEnvelope) -> MessagingResult<M> {
        if envelope.payload_type != M::EVENT_NAME {
            return Err(MessagingError::DeserializationError(format!(
                "expected payload type '{}', got '{}'",
                M::EVENT_NAME,
                envelope.payload_type
            )));
        }
        envelope.decode::<M>()
    }

    async fn quarantine(
        &self,
        envelope: &MessageEnvelope,
        error: MessagingError,
        attempts: u32,
    ) -> MessagingResult<DeliveryOutcome> {
        let record = self
            .dead_letters
            .send_to_dead_letter(envelope, &error, attempts)
            .await
            .map_err(|e| match e {
                MessagingError::DeadLetterFailed(_) => e,
                other => MessagingError::DeadLetterFailed(other.to_string()),
            })?;

        Ok(DeliveryOutcome::Quarantined {
            attempts,
            reason: record.failure_reason,
            location: record.dead_letter_location,
        })
    }

    fn log_failure(&self, envelope: &MessageEnvelope, error: &MessagingError, attempt: u32) {
        if self.policy.config().enable_detailed_logging {
            warn!(
                message_id = %envelope.message_id,
                source = %envelope.source,
                payload_type = %envelope.payload_type,
                attempt,
                error = %error,
                kind = error.kind(),
                transient = error.is_transient(),
                "Handler attempt failed"
            );
        } else {
            debug!(message_id = %envelope.message_id, attempt, kind = error.kind(), "Handler attempt failed");
        }
    }

    fn cancelled(&self, envelope: &MessageEnvelope, attempt: u32) -> MessagingError {
        debug!(
            message_id = %envelope.message_id,
            source = %envelope.source,
            attempt,
            "Handling cancelled"
        );
        MessagingError::Cancelled
    }
}

struct RetryingEnvelopeHandler<M, H> {
    middleware: Arc<MessageRetryMiddleware<M, H>>,
    handler: Arc<H>,
    cancel: CancelSignal,
}

#[async_trait]
impl<M, H> EnvelopeHandler for RetryingEnvelopeHandler<M, H>
where
    M: IntegrationEvent + Clone,
    H: MessageHandler<M>,
{
    async fn handle(&self, envelope: MessageEnvelope) -> MessagingResult<()> {
        if envelope.payload_type != M::EVENT_NAME && envelope.payload_type != crate::messaging::UNDECODABLE_PAYLOAD_TYPE {
            debug!(
                message_id = %envelope.message_id,
                payload_type = %envelope.payload_type,
                expected = M::EVENT_NAME,
                "Skipping message of another payload type"
            );
            return Ok(());
        }

        self.middleware
            .execute_with_retry(envelope, self.handler.as_ref(), &self.cancel)
            .await
            .map(|_| ())
    }
}

type MiddlewareKey = (TypeId, TypeId, String);

/// Hands out one middleware per (message type, handler type, source) triple
pub struct RetryMiddlewareFactory {
    policy: Arc<RetryPolicy>,
    dead_letters: Arc<dyn DeadLetterService>,
    instances: DashMap<MiddlewareKey, Arc<dyn Any + Send + Sync>>,
}

impl RetryMiddlewareFactory {
    pub fn new(policy: Arc<RetryPolicy>, dead_letters: Arc<dyn DeadLetterService>) -> Self {
        Self {
            policy,
            dead_letters,
            instances: DashMap::new(),
        }
    }

    /// Get or create the middleware for `M` handled by `H` from `source`
    pub fn get_or_create<M, H>(&self, source: &str) -> Arc<MessageRetryMiddleware<M, H>>
    where
        M: IntegrationEvent + Clone,
        H: MessageHandler<M>,
    {
        let key = (TypeId::of::<M>(), TypeId::of::<H>(), source.to_string());

        let instance = self
            .instances
            .entry(key)
            .or_insert_with(|| {
                debug!(
                    source = %source,
                    payload_type = M::EVENT_NAME,
                    handler = std::any::type_name::<H>(),
                    "Creating retry middleware"
                );
                Arc::new(MessageRetryMiddleware::<M, H>::new(
                    source,
                    self.policy.clone(),
                    self.dead_letters.clone(),
                )) as Arc<dyn Any + Send + Sync>
            })
            .clone();

        match instance.downcast::<MessageRetryMiddleware<M, H>>() {
            Ok(middleware) => middleware,
            Err(_) => unreachable!("middleware keys include the message and handler type ids"),
        }
    }

    /// Same as [`get_or_create`](Self::get_or_create), inferring the types
    /// from a handler value; useful for closure handlers
    pub fn get_or_create_for<M, H>(&self, _handler: &H, source: &str) -> Arc<MessageRetryMiddleware<M, H>>
    where
        M: IntegrationEvent + Clone,
        H: MessageHandler<M>,
    {
        self.get_or_create::<M, H>(source)
    }

    /// Number of distinct middleware instances created so far
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterRecord;
    use crate::messaging::{cancel_pair, TransportMode};
    use crate::retry::RetryPolicyConfig;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl IntegrationEvent for OrderPlaced {
        const EVENT_NAME: &'static str = "OrderPlaced";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: String,
    }

    impl IntegrationEvent for OrderShipped {
        const EVENT_NAME: &'static str = "OrderShipped";
    }

    #[derive(Default)]
    struct RecordingDeadLetters {
        records: Mutex<Vec<DeadLetterRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterService for RecordingDeadLetters {
        async fn send_to_dead_letter(
            &self,
            envelope: &MessageEnvelope,
            failure: &MessagingError,
            attempt_count: u32,
        ) -> MessagingResult<DeadLetterRecord> {
            if self.fail {
                return Err(MessagingError::BrokerUnreachable("dlq down".into()));
            }
            let record =
                DeadLetterRecord::new(envelope, failure, attempt_count, &RetryPolicyConfig::default(), "memory");
            self.records.lock().push(record.clone());
            Ok(record)
        }

        async fn ensure_infrastructure(&self) -> MessagingResult<()> {
            Ok(())
        }

        fn transport(&self) -> TransportMode {
            TransportMode::Disabled
        }
    }

    struct CountingHandler {
        calls: AtomicU32,
        error: fn() -> MessagingError,
    }

    #[async_trait]
    impl MessageHandler<OrderPlaced> for CountingHandler {
        async fn handle(&self, _message: OrderPlaced, _context: HandlerContext) -> MessagingResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    fn policy() -> Arc<RetryPolicy> {
        Arc::new(RetryPolicy::new(RetryPolicyConfig {
            max_retry_attempts: 3,
            initial_retry_delay_seconds: 2.0,
            backoff_multiplier: 2.0,
            ..Default::default()
        }))
    }

    fn order() -> MessageEnvelope {
        MessageEnvelope::for_payload(&OrderPlaced {
            order_id: "o-1".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_factory_reuses_instance_per_triple() {
        let factory = RetryMiddlewareFactory::new(policy(), Arc::new(RecordingDeadLetters::default()));

        let a = factory.get_or_create::<OrderPlaced, CountingHandler>("orders");
        let b = factory.get_or_create::<OrderPlaced, CountingHandler>("orders");
        let c = factory.get_or_create::<OrderPlaced, CountingHandler>("billing");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.len(), 2);
        assert_eq!(c.source(), "billing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let middleware =
            MessageRetryMiddleware::<OrderPlaced, CountingHandler>::new("orders", policy(), dead_letters.clone());
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            error: || MessagingError::Timeout("slow".into()),
        };
        let (trigger, signal) = cancel_pair();

        let run = middleware.execute_with_retry(order(), &handler, &signal);
        let cancel = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        };
        let (result, _) = tokio::join!(run, cancel);

        assert!(matches!(result, Err(MessagingError::Cancelled)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(dead_letters.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handler_cancellation_is_not_quarantined() {
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let middleware =
            MessageRetryMiddleware::<OrderPlaced, CountingHandler>::new("orders", policy(), dead_letters.clone());
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            error: || MessagingError::Cancelled,
        };

        let result = middleware.execute_with_retry(order(), &handler, &CancelSignal::never()).await;

        assert!(matches!(result, Err(MessagingError::Cancelled)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(dead_letters.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_already_cancelled_skips_handler() {
        let middleware = MessageRetryMiddleware::<OrderPlaced, CountingHandler>::new(
            "orders",
            policy(),
            Arc::new(RecordingDeadLetters::default()),
        );
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            error: || MessagingError::Timeout("slow".into()),
        };
        let (trigger, signal) = cancel_pair();
        trigger.cancel();

        let result = middleware.execute_with_retry(order(), &handler, &signal).await;
        assert!(matches!(result, Err(MessagingError::Cancelled)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_failure_is_surfaced() {
        let dead_letters = Arc::new(RecordingDeadLetters {
            fail: true,
            ..Default::default()
        });
        let middleware = MessageRetryMiddleware::<OrderPlaced, CountingHandler>::new("orders", policy(), dead_letters);
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            error: || MessagingError::Validation("missing sku".into()),
        };

        let result = middleware.execute_with_retry(order(), &handler, &CancelSignal::never()).await;
        assert!(matches!(result, Err(MessagingError::DeadLetterFailed(_))));
    }

    #[tokio::test]
    async fn test_wrong_payload_type_is_quarantined_without_handler_call() {
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let middleware =
            MessageRetryMiddleware::<OrderPlaced, CountingHandler>::new("orders", policy(), dead_letters.clone());
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            error: || MessagingError::Timeout("slow".into()),
        };
        let shipped = MessageEnvelope::for_payload(&OrderShipped {
            order_id: "o-1".into(),
        })
        .unwrap();

        let outcome = middleware
            .execute_with_retry(shipped, &handler, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome.attempts(), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        let records = dead_letters.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].failure_reason.kind, "deserialization_error");
        assert_eq!(records[0].envelope.source, "orders");
    }

    #[tokio::test]
    async fn test_envelope_handler_skips_other_payload_types() {
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let middleware = Arc::new(MessageRetryMiddleware::<OrderPlaced, CountingHandler>::new(
            "orders",
            policy(),
            dead_letters.clone(),
        ));
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            error: || MessagingError::Validation("bad".into()),
        });
        let envelope_handler = middleware.into_envelope_handler(handler.clone(), CancelSignal::never());

        let shipped = MessageEnvelope::for_payload(&OrderShipped {
            order_id: "o-2".into(),
        })
        .unwrap();
        envelope_handler.handle(shipped).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        envelope_handler.handle(order()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dead_letters.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_fn_receives_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |message: OrderPlaced, context: HandlerContext| {
            let sink = sink.clone();
            async move {
                sink.lock().push((message.order_id, context.attempt));
                Ok(())
            }
        });

        let factory = RetryMiddlewareFactory::new(policy(), Arc::new(RecordingDeadLetters::default()));
        let middleware = factory.get_or_create_for(&handler, "orders");
        let outcome = middleware
            .execute_with_retry(order(), &handler, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(*seen.lock(), vec![("o-1".to_string(), 1)]);
    }
}
