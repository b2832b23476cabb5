//! End-to-end retry and quarantine behavior through the messaging service

mod common;

use common::{order_envelope, permanent, transient, MemoryDeadLetters, OrderPlaced, RecordingBus, ScriptedHandler};
use reliable_messaging::messaging::{cancel_pair, CancelSignal, Environment, MessagingError};
use reliable_messaging::retry::{handler_fn, DeliveryOutcome, HandlerContext};
use reliable_messaging::{AppConfig, MessagingService};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn scenario_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.environment = Environment::Testing;
    config.dead_letter.max_retry_attempts = 3;
    config.dead_letter.initial_retry_delay_seconds = 2.0;
    config.dead_letter.backoff_multiplier = 2.0;
    config.dead_letter.enable_detailed_logging = true;
    config
}

async fn service_with(dead_letters: Arc<MemoryDeadLetters>, bus: Arc<RecordingBus>) -> MessagingService {
    MessagingService::builder(scenario_config())
        .with_message_bus(bus)
        .with_dead_letter_service(dead_letters)
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success_is_delivered() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let service = service_with(dead_letters.clone(), Arc::new(RecordingBus::default())).await;
    let handler = ScriptedHandler::new(2, transient);

    let started = Instant::now();
    let outcome = service
        .execute_with_retry::<OrderPlaced, _>(order_envelope("o-1"), &handler, "app.orders", &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
    assert_eq!(handler.calls(), 3);
    assert_eq!(handler.gaps_secs(), vec![2, 4]);
    assert_eq!(started.elapsed().as_secs(), 6);
    assert_eq!(dead_letters.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_transient_failure_is_quarantined_after_budget() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let service = service_with(dead_letters.clone(), Arc::new(RecordingBus::default())).await;
    let handler = ScriptedHandler::always_failing(transient);

    let outcome = service
        .execute_with_retry::<OrderPlaced, _>(order_envelope("o-2"), &handler, "app.orders", &CancelSignal::never())
        .await
        .unwrap();

    assert!(matches!(outcome, DeliveryOutcome::Quarantined { attempts: 3, .. }));
    assert_eq!(handler.calls(), 3);
    assert_eq!(handler.gaps_secs(), vec![2, 4]);

    let records = dead_letters.records.lock();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt_count, 3);
    assert_eq!(records[0].envelope.attempt_count, 3);
    assert_eq!(records[0].failure_reason.kind, "broker_unreachable");
    assert!(records[0].failure_reason.transient);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_quarantined_immediately() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let service = service_with(dead_letters.clone(), Arc::new(RecordingBus::default())).await;
    let handler = ScriptedHandler::always_failing(permanent);

    let started = Instant::now();
    let outcome = service
        .execute_with_retry::<OrderPlaced, _>(order_envelope("o-3"), &handler, "app.orders", &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(outcome.attempts(), 1);
    assert_eq!(handler.calls(), 1);
    assert_eq!(started.elapsed().as_millis(), 0);

    let records = dead_letters.records.lock();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt_count, 1);
    assert_eq!(records[0].failure_reason.kind, "deserialization_error");
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_body_is_quarantined_without_handler_call() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let service = service_with(dead_letters.clone(), Arc::new(RecordingBus::default())).await;
    let handler = ScriptedHandler::new(0, transient);

    let mut envelope = order_envelope("o-4");
    envelope.body = serde_json::json!({"order": 42});

    let outcome = service
        .execute_with_retry::<OrderPlaced, _>(envelope, &handler, "app.orders", &CancelSignal::never())
        .await
        .unwrap();

    assert!(!outcome.is_delivered());
    assert_eq!(handler.calls(), 0);
    assert_eq!(dead_letters.records.lock()[0].attempt_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff_propagates() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let service = service_with(dead_letters.clone(), Arc::new(RecordingBus::default())).await;
    let handler = ScriptedHandler::always_failing(transient);
    let (trigger, signal) = cancel_pair();

    let run = service.execute_with_retry::<OrderPlaced, _>(order_envelope("o-5"), &handler, "app.orders", &signal);
    let cancel = async {
        // First backoff is 2s, second is 4s; cancel during the second
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    };
    let (result, _) = tokio::join!(run, cancel);

    assert!(matches!(result, Err(MessagingError::Cancelled)));
    assert_eq!(handler.calls(), 2);
    assert_eq!(dead_letters.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_many_messages_wait_concurrently() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let service = Arc::new(service_with(dead_letters.clone(), Arc::new(RecordingBus::default())).await);
    let handler = Arc::new(handler_fn(|_order: OrderPlaced, context: HandlerContext| async move {
        if context.attempt < 3 {
            Err(MessagingError::Timeout("broker slow".to_string()))
        } else {
            Ok(())
        }
    }));

    let started = Instant::now();
    let mut tasks = Vec::new();
    for i in 0..50 {
        let service = service.clone();
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            service
                .execute_with_retry::<OrderPlaced, _>(
                    order_envelope(&format!("o-{}", i)),
                    handler.as_ref(),
                    "app.orders",
                    &CancelSignal::never(),
                )
                .await
        }));
    }

    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { attempts: 3 });
    }
    assert_eq!(started.elapsed().as_secs(), 6);
    assert_eq!(dead_letters.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_with_retry_routes_through_middleware() {
    let dead_letters = Arc::new(MemoryDeadLetters::default());
    let bus = Arc::new(RecordingBus::default());
    let service = service_with(dead_letters.clone(), bus.clone()).await;
    let handler = Arc::new(ScriptedHandler::always_failing(permanent));

    let handle = service
        .subscribe_with_retry::<OrderPlaced, _>(handler.clone(), Some("billing"))
        .await
        .unwrap();
    assert_eq!(handle.name(), "billing");

    let results = bus.deliver(order_envelope("o-6")).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok());
    assert_eq!(handler.calls(), 1);
    assert_eq!(dead_letters.count(), 1);
}

#[tokio::test]
async fn test_typed_send_and_publish_build_envelopes() {
    let bus = Arc::new(RecordingBus::default());
    let service = service_with(Arc::new(MemoryDeadLetters::default()), bus.clone()).await;
    let order = OrderPlaced {
        order_id: "o-7".to_string(),
        amount_cents: 500,
    };

    let sent_id = service.send(&order, Some("orders")).await.unwrap();
    let published_id = service.publish(&order, None).await.unwrap();

    let sent = bus.sent.lock();
    assert_eq!(sent[0].0, "orders");
    assert_eq!(sent[0].1.message_id, sent_id);
    assert_eq!(sent[0].1.payload_type, "OrderPlaced");
    assert_eq!(sent[0].1.source, "app.orders");

    let published = bus.published.lock();
    assert_eq!(published[0].0, "integration-events");
    assert_eq!(published[0].1.message_id, published_id);
    assert_eq!(published[0].1.decode::<OrderPlaced>().unwrap(), order);
}
