//! Event type registry
//!
//! Resolves wire payload type names to Rust types. Application modules
//! register their integration events explicitly through [`EventModule`]; the
//! registry builds an [`EventCatalog`] snapshot from them and caches it with a
//! time-to-live. [`EventTypeRegistry::invalidate_cache`] forces the next read
//! to rebuild, e.g. after a module is added at runtime.

mod catalog;
mod descriptor;

pub use catalog::EventCatalog;
pub use descriptor::{EventModule, EventRegistrar, EventTypeDescriptor};

use crate::messaging::{MessagingResult, MESSAGING_METRICS};
use moka::future::Cache;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default catalog lifetime before an automatic rebuild
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Cached catalog of integration event types
pub struct EventTypeRegistry {
    modules: RwLock<Vec<Arc<dyn EventModule>>>,
    cache: Cache<(), Arc<EventCatalog>>,
    rebuilds: AtomicU64,
}

impl EventTypeRegistry {
    pub fn new(cache_ttl: Duration) -> Self {
        let cache = Cache::builder().max_capacity(1).time_to_live(cache_ttl).build();

        Self {
            modules: RwLock::new(Vec::new()),
            cache,
            rebuilds: AtomicU64::new(0),
        }
    }

    pub fn with_modules(modules: Vec<Arc<dyn EventModule>>, cache_ttl: Duration) -> Self {
        let registry = Self::new(cache_ttl);
        *registry.modules.write() = modules;
        registry
    }

    /// Register a module and drop the cached catalog
    pub async fn add_module(&self, module: Arc<dyn EventModule>) {
        info!(module = %module.name(), "Event module added");
        self.modules.write().push(module);
        self.invalidate_cache().await;
    }

    /// The full catalog, rebuilt if the cached one expired or was invalidated.
    ///
    /// Concurrent callers on a miss share a single rebuild.
    pub async fn get_all_event_types(&self) -> Arc<EventCatalog> {
        self.cache.get_with((), async { self.rebuild() }).await
    }

    /// Look up one type by name.
    ///
    /// Fails with `UnknownEventType` if no module registered the name and with
    /// `AmbiguousEventType` if more than one module did.
    pub async fn get_event_type(&self, name: &str) -> MessagingResult<EventTypeDescriptor> {
        self.get_all_event_types().await.get(name).cloned()
    }

    /// Deserialize `body` as the type registered under `payload_type`
    pub async fn decode(&self, payload_type: &str, body: &serde_json::Value) -> MessagingResult<Box<dyn Any + Send>> {
        self.get_event_type(payload_type).await?.decode(body)
    }

    pub async fn invalidate_cache(&self) {
        self.cache.invalidate(&()).await;
        debug!("Event type catalog invalidated");
    }

    /// Number of catalog builds since creation
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.read().iter().map(|m| m.name().to_string()).collect()
    }

    fn rebuild(&self) -> Arc<EventCatalog> {
        let modules = self.modules.read().clone();
        let catalog = EventCatalog::build(&modules);

        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        MESSAGING_METRICS.registry_rebuilds.inc();
        info!(
            modules = modules.len(),
            event_types = catalog.len(),
            conflicts = catalog.conflicts().len(),
            "Event type catalog rebuilt"
        );

        Arc::new(catalog)
    }
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
