//! Shared consumer-side plumbing for the broker-backed buses

use crate::messaging::cancel::CancelSignal;
use crate::messaging::config::TransportMode;
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::error::MessagingResult;
use crate::messaging::metrics::MESSAGING_METRICS;
use crate::messaging::traits::EnvelopeHandler;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// First pause before a failed message is handed to the handler again
pub const REDELIVERY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Longest pause between redeliveries of one message
pub const REDELIVERY_MAX_DELAY: Duration = Duration::from_secs(30);

/// What a consumer loop does with a message after its handler returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and move on
    Ack,
    /// Keep the message and hand it to the handler again
    Redeliver,
    /// The handler was cancelled; stop consuming without acknowledging
    Abandon,
}

impl Disposition {
    pub fn of(result: &MessagingResult<()>) -> Self {
        match result {
            Ok(()) => Disposition::Ack,
            Err(e) if e.is_cancellation() => Disposition::Abandon,
            Err(_) => Disposition::Redeliver,
        }
    }
}

/// Pause before redelivery number `redelivery` (1-based), doubling from
/// [`REDELIVERY_BASE_DELAY`] up to [`REDELIVERY_MAX_DELAY`]
pub fn redelivery_delay(redelivery: u32) -> Duration {
    let exponent = redelivery.saturating_sub(1).min(16);
    REDELIVERY_BASE_DELAY
        .saturating_mul(1u32 << exponent)
        .min(REDELIVERY_MAX_DELAY)
}

/// Log a message the transport cannot hold on to, with its full body so an
/// operator can replay it
pub fn log_unacknowledged(bytes: &[u8], source: &str, reason: &str) {
    error!(
        source = %source,
        reason = %reason,
        message = %String::from_utf8_lossy(bytes),
        "Message left unacknowledged"
    );
}

/// Payload type given to wire messages that are not valid envelopes
pub const UNDECODABLE_PAYLOAD_TYPE: &str = "__undecodable__";

/// Header carrying the reason a wire message could not be decoded
pub const DECODE_ERROR_HEADER: &str = "x-decode-error";

/// Turn raw bytes from the wire into an envelope.
///
/// Bytes that are not a valid envelope still produce one, carrying the raw
/// text as its body, so the failure reaches the handler chain and ends up
/// quarantined instead of being dropped here.
pub fn envelope_from_wire(bytes: &[u8], source: &str) -> MessageEnvelope {
    match MessageEnvelope::from_bytes(bytes) {
        Ok(envelope) => {
            if envelope.source.is_empty() {
                envelope.with_source(source)
            } else {
                envelope
            }
        }
        Err(e) => {
            warn!(source = %source, error = %e, "Received message that is not a valid envelope");
            MessageEnvelope::new(
                UNDECODABLE_PAYLOAD_TYPE,
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
            )
            .with_source(source)
            .with_header(DECODE_ERROR_HEADER, e.to_string())
        }
    }
}

/// Hand one wire message to a subscription handler
pub async fn dispatch(
    handler: &Arc<dyn EnvelopeHandler>,
    bytes: &[u8],
    source: &str,
    transport: TransportMode,
) -> MessagingResult<()> {
    let envelope = envelope_from_wire(bytes, source);
    let message_id = envelope.message_id.clone();

    debug!(
        message_id = %message_id,
        source = %source,
        transport = %transport,
        "Dispatching message to handler"
    );

    let result = handler.handle(envelope).await;
    match &result {
        Ok(()) => {}
        Err(e) if e.is_cancellation() => {
            debug!(message_id = %message_id, source = %source, "Handler cancelled");
        }
        Err(e) => {
            MESSAGING_METRICS
                .consume_failures
                .with_label_values(&[source, transport.as_str(), e.kind()])
                .inc();
            error!(
                message_id = %message_id,
                source = %source,
                error = %e,
                "Handler returned an error, message left for redelivery"
            );
        }
    }
    result
}

/// Hand one message to the handler until it is acknowledged or the
/// subscription is cancelled.
///
/// Used by transports that do not redeliver on their own: the message stays
/// in memory between attempts, paced by [`redelivery_delay`]. Returns
/// [`Disposition::Ack`] or [`Disposition::Abandon`], never `Redeliver`.
pub async fn dispatch_until_settled(
    handler: &Arc<dyn EnvelopeHandler>,
    bytes: &[u8],
    source: &str,
    transport: TransportMode,
    signal: &CancelSignal,
) -> Disposition {
    let mut redeliveries = 0u32;
    loop {
        let result = dispatch(handler, bytes, source, transport).await;
        match Disposition::of(&result) {
            Disposition::Ack => return Disposition::Ack,
            Disposition::Abandon => {
                log_unacknowledged(bytes, source, "handler cancelled");
                return Disposition::Abandon;
            }
            Disposition::Redeliver => {
                redeliveries = redeliveries.saturating_add(1);
                let delay = redelivery_delay(redeliveries);
                warn!(
                    source = %source,
                    redeliveries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Holding message for redelivery"
                );

                tokio::select! {
                    biased;
                    _ = signal.cancelled() => {
                        log_unacknowledged(bytes, source, "subscription cancelled before redelivery");
                        return Disposition::Abandon;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
