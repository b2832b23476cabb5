//! Transport-agnostic message bus
//!
//! Application code sends commands to queues and publishes integration events
//! to topics through the [`MessageBus`] trait. The concrete transport is picked
//! once at startup from the enabled flag and the deployment environment and
//! never changes afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              MessageBus trait                    │
//! ├─────────────────────────────────────────────────┤
//! │  - send()         - publish()                    │
//! │  - subscribe()    - subscribe_queue()            │
//! └─────────────────────────────────────────────────┘
//!                      │
//!        resolve_transport_mode(enabled, environment)
//!                      │
//!      ┌───────────────┼────────────────┐
//!      ▼               ▼                ▼
//! ┌──────────┐  ┌──────────────┐  ┌──────────┐
//! │  NATS    │  │  Kafka       │  │  No-op   │
//! ├──────────┤  ├──────────────┤  ├──────────┤
//! │ local    │  │ managed      │  │ disabled │
//! │ broker   │  │ cloud broker │  │          │
//! └──────────┘  └──────────────┘  └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use reliable_messaging::messaging::{create_message_bus, Environment, MessageEnvelope, MessagingConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessagingConfig::default();
//!     let bus = create_message_bus(&config, &Environment::Development, None).await?;
//!
//!     let envelope = MessageEnvelope::new("OrderPlaced", serde_json::json!({"order_id": "o-1"}));
//!     bus.publish(envelope, None).await?;
//!
//!     Ok(())
//! }
//! ```

mod cancel;
mod config;
mod consumer;
mod credentials;
mod envelope;
mod error;
pub mod factory;
pub mod kafka;
mod metrics;
pub mod nats;
mod noop;
mod traits;

pub use cancel::{cancel_pair, CancelSignal, CancelTrigger};
pub use config::{is_placeholder, Environment, KafkaConfig, MessagingConfig, NatsConfig, TransportMode};
pub use consumer::{envelope_from_wire, DECODE_ERROR_HEADER, UNDECODABLE_PAYLOAD_TYPE};
pub use credentials::{Credential, CredentialCache, CredentialSource};
pub use envelope::{IntegrationEvent, MessageEnvelope};
pub use error::{MessagingError, MessagingResult};
pub use factory::{
    build_for_environment, build_prepared, create_message_bus, prepare_transport, resolve_transport_mode,
    validate_transport_config, MessageBusBuilder, PreparedTransport, TransportBuilder, TransportResolution,
};
pub use kafka::KafkaMessageBus;
pub use metrics::{gather_metrics, init_messaging_metrics, MESSAGING_METRICS};
pub use nats::NatsMessageBus;
pub use noop::NoopMessageBus;
pub use traits::{envelope_handler_fn, EnvelopeHandler, MessageBus, SubscriptionHandle};
