//! Shared fakes for integration tests
//!
//! In-memory message bus and dead letter service that record every call, and
//! handlers with scripted failures.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use reliable_messaging::dead_letter::{DeadLetterRecord, DeadLetterService};
use reliable_messaging::messaging::{
    EnvelopeHandler, IntegrationEvent, MessageBus, MessageEnvelope, MessagingError, MessagingResult,
    SubscriptionHandle, TransportMode,
};
use reliable_messaging::retry::{HandlerContext, MessageHandler, RetryPolicyConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub amount_cents: u64,
}

impl IntegrationEvent for OrderPlaced {
    const EVENT_NAME: &'static str = "OrderPlaced";
}

pub fn order_envelope(order_id: &str) -> MessageEnvelope {
    MessageEnvelope::for_payload(&OrderPlaced {
        order_id: order_id.to_string(),
        amount_cents: 1299,
    })
    .unwrap()
    .with_source("app.orders")
}

/// Dead letter service keeping records in memory
#[derive(Default)]
pub struct MemoryDeadLetters {
    pub records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetters {
    pub fn count(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl DeadLetterService for MemoryDeadLetters {
    async fn send_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
        failure: &MessagingError,
        attempt_count: u32,
    ) -> MessagingResult<DeadLetterRecord> {
        let record = DeadLetterRecord::new(envelope, failure, attempt_count, &RetryPolicyConfig::default(), "memory");
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

/// Message bus recording outbound traffic and subscribers
#[derive(Default)]
pub struct RecordingBus {
    pub sent: Mutex<Vec<(String, MessageEnvelope)>>,
    pub published: Mutex<Vec<(String, MessageEnvelope)>>,
    pub handlers: Mutex<Vec<Arc<dyn EnvelopeHandler>>>,
}

impl RecordingBus {
    /// Feed an envelope to every registered subscriber
    pub async fn deliver(&self, envelope: MessageEnvelope) -> Vec<MessagingResult<()>> {
        let handlers: Vec<_> = self.handlers.lock().clone();
        let mut results = Vec::new();
        for handler in handlers {
            results.push(handler.handle(envelope.clone()).await);
        }
        results
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn send(&self, envelope: MessageEnvelope, destination: Option<&str>) -> MessagingResult<()> {
        self.sent
            .lock()
            .push((destination.unwrap_or("commands").to_string(), envelope));
        Ok(())
    }

    async fn publish(&self, envelope: MessageEnvelope, topic: Option<&str>) -> MessagingResult<()> {
        self.published
            .lock()
            .push((topic.unwrap_or("integration-events").to_string(), envelope));
        Ok(())
    }

    async fn subscribe(
        &self,
        handler: Arc<dyn EnvelopeHandler>,
        subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        self.handlers.lock().push(handler);
        Ok(SubscriptionHandle::inert(subscription_name.unwrap_or("default")))
    }

    async fn subscribe_queue(
        &self,
        queue: &str,
        handler: Arc<dyn EnvelopeHandler>,
        _subscription_name: Option<&str>,
    ) -> MessagingResult<SubscriptionHandle> {
        self.handlers.lock().push(handler);
        Ok(SubscriptionHandle::inert(queue))
    }

    async fn ensure_infrastructure(&self) -> MessagingResult<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> MessagingResult<()> {
        Ok(())
    }

    fn transport(&self) -> TransportMode {
        TransportMode::Disabled
    }
}

/// Handler failing its first `failures` attempts with `error`, then succeeding
pub struct ScriptedHandler {
    pub failures: u32,
    pub error: fn() -> MessagingError,
    pub calls: AtomicU32,
    pub call_times: Mutex<Vec<Instant>>,
}

impl ScriptedHandler {
    pub fn new(failures: u32, error: fn() -> MessagingError) -> Self {
        Self {
            failures,
            error,
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing(error: fn() -> MessagingError) -> Self {
        Self::new(u32::MAX, error)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Gaps between consecutive handler calls, in whole seconds
    pub fn gaps_secs(&self) -> Vec<u64> {
        let times = self.call_times.lock();
        times.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect()
    }
}

#[async_trait]
impl MessageHandler<OrderPlaced> for ScriptedHandler {
    async fn handle(&self, _message: OrderPlaced, context: HandlerContext) -> MessagingResult<()> {
        self.call_times.lock().push(Instant::now());
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(call, context.attempt);
        if call <= self.failures {
            Err((self.error)())
        } else {
            Ok(())
        }
    }
}

pub fn transient() -> MessagingError {
    MessagingError::BrokerUnreachable("connection refused".to_string())
}

pub fn permanent() -> MessagingError {
    MessagingError::DeserializationError("missing field `order_id`".to_string())
}
