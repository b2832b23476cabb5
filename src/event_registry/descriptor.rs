//! Event type descriptors and per-module registration

use crate::messaging::{IntegrationEvent, MessagingError, MessagingResult};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

type Decoder = Arc<dyn Fn(&serde_json::Value) -> MessagingResult<Box<dyn Any + Send>> + Send + Sync>;

/// A registered integration event type
#[derive(Clone)]
pub struct EventTypeDescriptor {
    pub name: String,
    /// Module that registered the type
    pub module: String,
    /// Fully qualified Rust type name
    pub rust_type: &'static str,
    pub type_id: TypeId,
    decoder: Decoder,
}

impl EventTypeDescriptor {
    pub fn of<T: IntegrationEvent>(module: impl Into<String>) -> Self {
        Self {
            name: T::EVENT_NAME.to_string(),
            module: module.into(),
            rust_type: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            decoder: Arc::new(|body| {
                serde_json::from_value::<T>(body.clone())
                    .map(|event| Box::new(event) as Box<dyn Any + Send>)
                    .map_err(|e| {
                        MessagingError::DeserializationError(format!("failed to decode '{}': {}", T::EVENT_NAME, e))
                    })
            }),
        }
    }

    /// Deserialize `body` into this type, boxed
    pub fn decode(&self, body: &serde_json::Value) -> MessagingResult<Box<dyn Any + Send>> {
        (self.decoder)(body)
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for EventTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypeDescriptor")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("rust_type", &self.rust_type)
            .finish()
    }
}

/// An application module contributing integration event types
pub trait EventModule: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, registrar: &mut EventRegistrar);
}

/// Collects the descriptors one module registers
pub struct EventRegistrar {
    module: String,
    descriptors: Vec<EventTypeDescriptor>,
}

impl EventRegistrar {
    pub(crate) fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            descriptors: Vec::new(),
        }
    }

    /// Register `T` under its `EVENT_NAME`. Registering the same type twice is a no-op.
    pub fn register<T: IntegrationEvent>(&mut self) -> &mut Self {
        if !self.descriptors.iter().any(|d| d.is::<T>()) {
            self.descriptors.push(EventTypeDescriptor::of::<T>(self.module.clone()));
        }
        self
    }

    pub(crate) fn into_descriptors(self) -> Vec<EventTypeDescriptor> {
        self.descriptors
    }
}
