//! Reliability layer for asynchronous messaging
//!
//! - [`messaging`]: transport resolution and the message bus (NATS, Kafka, no-op)
//! - [`retry`]: retry policy and the retry middleware state machine
//! - [`dead_letter`]: quarantine of messages that exhausted their retries
//! - [`event_registry`]: cached catalog of integration event types
//! - [`service`]: facade wiring the above together for a host process

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod event_registry;
pub mod messaging;
pub mod retry;
pub mod service;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use service::{MessagingService, MessagingServiceBuilder};
