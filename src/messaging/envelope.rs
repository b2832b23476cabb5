//! Wire envelope for commands and integration events

use crate::messaging::error::{MessagingError, MessagingResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// A payload type that can travel inside a [`MessageEnvelope`].
///
/// `EVENT_NAME` is the name written to the wire and the key under which the
/// type is registered in the event type registry.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_NAME: &'static str;
}

/// Message envelope wrapping a serialized payload with routing and retry metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message ID
    pub message_id: String,

    /// Name of the payload type, resolved through the event type registry
    pub payload_type: String,

    /// Serialized payload
    pub body: serde_json::Value,

    /// Number of handling attempts made so far
    #[serde(default)]
    pub attempt_count: u32,

    /// Correlation ID
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Queue or topic the message was read from or sent to
    #[serde(default)]
    pub source: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Custom headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl MessageEnvelope {
    /// Create a new envelope around an already serialized body
    pub fn new(payload_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            payload_type: payload_type.into(),
            body,
            attempt_count: 0,
            correlation_id: None,
            source: String::new(),
            created_at: Utc::now(),
            headers: HashMap::new(),
        }
    }

    /// Serialize a typed payload into a new envelope
    pub fn for_payload<T: IntegrationEvent>(payload: &T) -> MessagingResult<Self> {
        let body = serde_json::to_value(payload)?;
        Ok(Self::new(T::EVENT_NAME, body))
    }

    /// Create with correlation ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the source queue or topic
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Add a custom header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Deserialize the body into a concrete payload type
    pub fn decode<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            MessagingError::DeserializationError(format!(
                "payload '{}' of message {}: {}",
                self.payload_type, self.message_id, e
            ))
        })
    }

    /// Encode the envelope for the wire
    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope read from the wire
    pub fn from_bytes(bytes: &[u8]) -> MessagingResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MessagingError::DeserializationError(format!("invalid envelope: {}", e)))
    }
}
