//! Error types for messaging operations

use crate::error::AppError;

/// Result type for messaging operations
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Broker could not be reached
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Publish failed
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Subscribe failed
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Consume failed
    #[error("Consume failed: {0}")]
    ConsumeFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Backend not available
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Broker rejected the client's credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Broker rejected the request because of rate limits
    #[error("Throttled by broker: {0}")]
    Throttled(String),

    /// Handler rejected the message as invalid
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Handler failed for a reason it did not classify
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Processing was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Quarantining a message failed
    #[error("Dead letter write failed: {0}")]
    DeadLetterFailed(String),

    /// More than one module registered the same event name
    #[error("Ambiguous event type '{name}' registered by modules: {}", modules.join(", "))]
    AmbiguousEventType { name: String, modules: Vec<String> },

    /// No module registered the event name
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

impl MessagingError {
    /// Stable identifier for the error kind, used in dead letter records and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::ConnectionFailed(_) => "connection_failed",
            MessagingError::BrokerUnreachable(_) => "broker_unreachable",
            MessagingError::PublishFailed(_) => "publish_failed",
            MessagingError::SubscribeFailed(_) => "subscribe_failed",
            MessagingError::ConsumeFailed(_) => "consume_failed",
            MessagingError::SerializationError(_) => "serialization_error",
            MessagingError::DeserializationError(_) => "deserialization_error",
            MessagingError::ConfigurationError(_) => "configuration",
            MessagingError::BackendUnavailable(_) => "backend_unavailable",
            MessagingError::Timeout(_) => "timeout",
            MessagingError::Throttled(_) => "throttled",
            MessagingError::AuthenticationFailed(_) => "authentication_failed",
            MessagingError::Validation(_) => "validation",
            MessagingError::HandlerFailed(_) => "handler_failed",
            MessagingError::Cancelled => "cancelled",
            MessagingError::DeadLetterFailed(_) => "dead_letter_failed",
            MessagingError::AmbiguousEventType { .. } => "ambiguous_event_type",
            MessagingError::UnknownEventType(_) => "unknown_event_type",
        }
    }

    /// Whether the failure is transient and worth another attempt.
    ///
    /// Network, broker availability, timeout and throttling failures are
    /// transient. Payload, validation and configuration failures are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionFailed(_)
                | MessagingError::BrokerUnreachable(_)
                | MessagingError::PublishFailed(_)
                | MessagingError::ConsumeFailed(_)
                | MessagingError::BackendUnavailable(_)
                | MessagingError::Timeout(_)
                | MessagingError::Throttled(_)
                | MessagingError::AuthenticationFailed(_)
                | MessagingError::HandlerFailed(_)
        )
    }

    /// Whether this error is a cancellation signal rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, MessagingError::Cancelled)
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::SerializationError(err.to_string())
    }
}

impl From<MessagingError> for AppError {
    fn from(err: MessagingError) -> Self {
        match err {
            MessagingError::ConfigurationError(msg) => AppError::Configuration(msg),
            _ => AppError::Messaging(err.to_string()),
        }
    }
}
