//! Immutable name to type snapshot

use crate::event_registry::descriptor::{EventModule, EventRegistrar, EventTypeDescriptor};
use crate::messaging::{MessagingError, MessagingResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Snapshot of every registered event type.
///
/// Names registered by more than one module are kept out of the lookup table
/// and reported as conflicts.
#[derive(Debug, Default)]
pub struct EventCatalog {
    types: HashMap<String, EventTypeDescriptor>,
    conflicts: BTreeMap<String, Vec<String>>,
}

impl EventCatalog {
    /// Build a catalog from scratch out of `modules`
    pub fn build(modules: &[Arc<dyn EventModule>]) -> Self {
        let mut candidates: HashMap<String, Vec<EventTypeDescriptor>> = HashMap::new();

        for module in modules {
            let mut registrar = EventRegistrar::new(module.name());
            module.register(&mut registrar);
            for descriptor in registrar.into_descriptors() {
                candidates.entry(descriptor.name.clone()).or_default().push(descriptor);
            }
        }

        let mut catalog = EventCatalog::default();
        for (name, mut descriptors) in candidates {
            // The same type reachable through two modules is not a conflict
            let first = descriptors[0].type_id;
            if descriptors.iter().all(|d| d.type_id == first) {
                catalog.types.insert(name, descriptors.swap_remove(0));
                continue;
            }

            let modules: Vec<String> = descriptors.iter().map(|d| d.module.clone()).collect();
            warn!(
                event_type = %name,
                modules = ?modules,
                "Event type name registered by several modules, lookups will fail until resolved"
            );
            catalog.conflicts.insert(name, modules);
        }

        catalog
    }

    /// Look up a type by name
    pub fn get(&self, name: &str) -> MessagingResult<&EventTypeDescriptor> {
        if let Some(modules) = self.conflicts.get(name) {
            return Err(MessagingError::AmbiguousEventType {
                name: name.to_string(),
                modules: modules.clone(),
            });
        }
        self.types
            .get(name)
            .ok_or_else(|| MessagingError::UnknownEventType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Sorted names of every resolvable type
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventTypeDescriptor> {
        self.types.values()
    }

    pub fn conflicts(&self) -> &BTreeMap<String, Vec<String>> {
        &self.conflicts
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
