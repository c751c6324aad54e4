//! Cache Registry (component D): owns every named cache, guarantees unique
//! names, and drives `clear()`/`dispose()` across all of them in
//! registration order (§4.4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bus::{ClusterTransport, EventBus};
use crate::cache::{LoaderSet, QuantumCache};
use crate::config::{CacheOptions, RegistryOptions};
use crate::error::{QkvcError, Result};
use crate::store::MemoryCache;

/// Type-erased handle the registry keeps per named cache so it can fan
/// `clear`/`dispose` out across every `V` it was parameterized with,
/// without knowing any of them at the registry's own type level.
#[async_trait]
trait ManagedCache: Send + Sync {
    fn name(&self) -> &str;
    fn clear(&self);
    async fn dispose(&self);
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> ManagedCache for Arc<QuantumCache<V>> {
    fn name(&self) -> &str {
        QuantumCache::name(self)
    }

    fn clear(&self) {
        let _ = QuantumCache::clear(self);
    }

    async fn dispose(&self) {
        QuantumCache::dispose(self).await;
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> ManagedCache for Arc<MemoryCache<V>> {
    fn name(&self) -> &str {
        MemoryCache::name(self)
    }

    fn clear(&self) {
        MemoryCache::clear(self);
    }

    async fn dispose(&self) {
        MemoryCache::clear(self);
    }
}

/// Owns the shared [`EventBus`] and every cache created through it. A
/// process is expected to hold exactly one of these (§9 "global state"); the
/// type itself doesn't enforce that, it just doesn't make instantiating more
/// than one of any use since caches don't share tables across registries.
pub struct CacheRegistry {
    bus: Arc<EventBus>,
    process_id: String,
    local_host: Option<String>,
    order: Mutex<Vec<Arc<dyn ManagedCache>>>,
}

impl CacheRegistry {
    /// Build a registry wired to an in-process transport. For a real
    /// cluster deployment, construct the bus yourself with a networked
    /// [`ClusterTransport`] and use [`Self::with_bus`].
    #[must_use]
    pub fn new(opts: RegistryOptions) -> Arc<Self> {
        let transport: Arc<dyn ClusterTransport> =
            Arc::new(crate::bus::transport::InMemoryClusterTransport::default());
        Self::with_bus(opts, transport)
    }

    /// Build a registry around a caller-supplied transport (e.g. a gossip
    /// mesh or message-broker backed one) and start forwarding remote frames.
    #[must_use]
    pub fn with_bus(opts: RegistryOptions, transport: Arc<dyn ClusterTransport>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(transport, opts.process_id().to_string()));
        let _receiver = bus.clone().spawn_receiver();
        Arc::new(Self {
            bus,
            process_id: opts.process_id().to_string(),
            local_host: opts.local_host().map(str::to_string),
            order: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// The locally configured host, used to null-normalize accts (§4.5.2).
    #[must_use]
    pub fn local_host(&self) -> Option<&str> {
        self.local_host.as_deref()
    }

    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    fn reserve_name(&self, name: &str) -> Result<()> {
        let order = self.order.lock();
        if order.iter().any(|c| c.name() == name) {
            return Err(QkvcError::internal(format!("cache name already registered: {name}")));
        }
        Ok(())
    }

    /// Create and register a [`QuantumCache`]. Fails if `opts.name()` is
    /// already taken by another cache in this registry.
    pub fn create_quantum<V: Clone + Send + Sync + 'static>(
        &self,
        opts: CacheOptions,
        loaders: LoaderSet<V>,
    ) -> Result<Arc<QuantumCache<V>>> {
        self.reserve_name(opts.name())?;
        let cache = QuantumCache::new(opts, loaders, self.bus.clone());
        self.order.lock().push(Arc::new(cache.clone()) as Arc<dyn ManagedCache>);
        Ok(cache)
    }

    /// Create and register a plain [`MemoryCache`] with no loader pipeline
    /// and no cluster coherence (§4.4).
    pub fn create_memory<V: Clone + Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        lifetime: Duration,
    ) -> Result<Arc<MemoryCache<V>>> {
        let name = name.into();
        self.reserve_name(&name)?;
        let cache = Arc::new(MemoryCache::new(name, lifetime));
        self.order.lock().push(Arc::new(cache.clone()) as Arc<dyn ManagedCache>);
        Ok(cache)
    }

    /// Names of every registered cache, in registration order. Operational
    /// visibility only — no metrics exporter sits behind this.
    #[must_use]
    pub fn cache_names(&self) -> Vec<String> {
        self.order.lock().iter().map(|c| c.name().to_string()).collect()
    }

    /// Clear every registered cache's memory in place, without disposing
    /// any of them.
    pub fn clear(&self) {
        for cache in self.order.lock().iter() {
            cache.clear();
        }
    }

    /// Dispose every registered cache, in the order they were created.
    /// Idempotent per-cache; calling this twice is harmless.
    pub async fn dispose(&self) {
        let snapshot: Vec<Arc<dyn ManagedCache>> = self.order.lock().clone();
        for cache in snapshot {
            cache.dispose().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests can use unwrap for simplicity
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cache::LoaderSet;
    use crate::config::CacheOptions;

    fn registry() -> Arc<CacheRegistry> {
        CacheRegistry::new(RegistryOptions::new("test-process", "example.com"))
    }

    fn loaders() -> LoaderSet<i32> {
        LoaderSet::new(|_key, _ctx| async { Ok(Some(1)) })
    }

    #[tokio::test]
    async fn test_create_quantum_registers_cache() {
        let registry = registry();
        let cache = registry
            .create_quantum(CacheOptions::new("users", Duration::from_secs(60)), loaders())
            .expect("first registration succeeds");
        assert_eq!(cache.name(), "users");
    }

    #[tokio::test]
    async fn test_duplicate_name_across_kinds_is_rejected() {
        let registry = registry();
        registry.create_quantum(CacheOptions::new("users", Duration::from_secs(60)), loaders()).unwrap();
        let second = registry.create_quantum(CacheOptions::new("users", Duration::from_secs(60)), loaders());
        assert!(second.is_err());

        let memory_collision = registry.create_memory::<i32>("users", Duration::from_secs(60));
        assert!(memory_collision.is_err());
    }

    #[tokio::test]
    async fn test_create_memory_registers_cache() {
        let registry = registry();
        let cache = registry
            .create_memory::<i32>("sessionTokens", Duration::from_secs(60))
            .expect("first registration succeeds");
        cache.set("k", 1, None);
        assert_eq!(cache.get("k"), Some(1));
    }

    #[tokio::test]
    async fn test_clear_wipes_every_registered_cache() {
        let registry = registry();
        let quantum = registry
            .create_quantum(CacheOptions::new("users", Duration::from_secs(60)), loaders())
            .unwrap();
        let memory = registry.create_memory::<i32>("sessionTokens", Duration::from_secs(60)).unwrap();
        quantum.set("k".to_string(), 1).await.unwrap();
        memory.set("k", 1, None);

        registry.clear();

        assert!(!quantum.has("k"));
        assert_eq!(memory.get("k"), None);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_across_all_registered_caches() {
        let registry = registry();
        registry.create_quantum(CacheOptions::new("users", Duration::from_secs(60)), loaders()).unwrap();
        registry.create_memory::<i32>("sessionTokens", Duration::from_secs(60)).unwrap();

        registry.dispose().await;
        registry.dispose().await;
    }
}
