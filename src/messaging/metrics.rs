//! Prometheus metrics for messaging

use crate::messaging::config::TransportMode;
use crate::messaging::error::MessagingResult;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};

/// Messaging metrics
pub struct MessagingMetrics {
    /// Messages sent to queues
    pub messages_sent: CounterVec,

    /// Messages published to topics
    pub messages_published: CounterVec,

    /// Message send/publish failures
    pub publish_failures: CounterVec,

    /// Messages a subscription handler failed to process
    pub consume_failures: CounterVec,

    /// Handler invocations made by the retry middleware
    pub handler_attempts: CounterVec,

    /// Retries scheduled after a transient failure
    pub retries_scheduled: CounterVec,

    /// Messages handled successfully
    pub messages_delivered: CounterVec,

    /// Messages moved to a dead letter location
    pub messages_dead_lettered: CounterVec,

    /// Backoff delay applied before a retry
    pub retry_delay: HistogramVec,

    /// Event type catalog rebuilds
    pub registry_rebuilds: IntCounter,
}

lazy_static! {
    pub static ref MESSAGING_METRICS: MessagingMetrics = MessagingMetrics {
        messages_sent: register_counter_vec!(
            "messaging_messages_sent_total",
            "Total number of messages sent to queues",
            &["destination", "transport"]
        )
        .unwrap(),

        messages_published: register_counter_vec!(
            "messaging_messages_published_total",
            "Total number of messages published to topics",
            &["destination", "transport"]
        )
        .unwrap(),

        publish_failures: register_counter_vec!(
            "messaging_publish_failures_total",
            "Total number of send and publish failures",
            &["destination", "transport", "error"]
        )
        .unwrap(),

        consume_failures: register_counter_vec!(
            "messaging_consume_failures_total",
            "Total number of messages a subscription handler failed to process",
            &["source", "transport", "error"]
        )
        .unwrap(),

        handler_attempts: register_counter_vec!(
            "messaging_handler_attempts_total",
            "Total number of handler invocations",
            &["source"]
        )
        .unwrap(),

        retries_scheduled: register_counter_vec!(
            "messaging_retries_scheduled_total",
            "Total number of retries scheduled after transient failures",
            &["source"]
        )
        .unwrap(),

        messages_delivered: register_counter_vec!(
            "messaging_messages_delivered_total",
            "Total number of messages handled successfully",
            &["source"]
        )
        .unwrap(),

        messages_dead_lettered: register_counter_vec!(
            "messaging_messages_dead_lettered_total",
            "Total number of messages quarantined",
            &["source", "reason"]
        )
        .unwrap(),

        retry_delay: register_histogram_vec!(
            "messaging_retry_delay_seconds",
            "Backoff delay applied before a retry in seconds",
            &["source"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0]
        )
        .unwrap(),

        registry_rebuilds: register_int_counter!(
            "messaging_event_registry_rebuilds_total",
            "Total number of event type catalog rebuilds"
        )
        .unwrap(),
    };
}

/// Initialize messaging metrics
pub fn init_messaging_metrics() {
    lazy_static::initialize(&MESSAGING_METRICS);
}

/// Outbound operation recorded by [`record_outbound`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Send,
    Publish,
}

/// Record the result of a send or publish
pub fn record_outbound(
    operation: Outbound,
    destination: &str,
    transport: TransportMode,
    result: &MessagingResult<()>,
) {
    match result {
        Ok(()) => {
            let counter = match operation {
                Outbound::Send => &MESSAGING_METRICS.messages_sent,
                Outbound::Publish => &MESSAGING_METRICS.messages_published,
            };
            counter
                .with_label_values(&[destination, transport.as_str()])
                .inc();
        }
        Err(e) => {
            MESSAGING_METRICS
                .publish_failures
                .with_label_values(&[destination, transport.as_str(), e.kind()])
                .inc();
        }
    }
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exposed() {
        init_messaging_metrics();
        MESSAGING_METRICS
            .messages_dead_lettered
            .with_label_values(&["orders", "timeout"])
            .inc();

        let output = gather_metrics();
        assert!(output.contains("messaging_messages_dead_lettered_total"));
    }
}
