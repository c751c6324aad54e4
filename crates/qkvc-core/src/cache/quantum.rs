//! The `QuantumCache<V>` type: public contract (§4.3.1), fetch
//! de-duplication (§4.3.2), nested concurrency limiters (§4.3.3), the
//! coherence protocol (§4.3.4), and disposal (§4.3.1 lifecycle).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, HandlerId, HandlerOptions};
use crate::cache::loader::{LoaderContext, LoaderSet};
use crate::config::CacheOptions;
use crate::error::{QkvcError, Result};
use crate::store::MemoryStore;

const TOPIC_UPDATED: &str = "quantumCacheUpdated";
const TOPIC_RESET: &str = "quantumCacheReset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Disposing,
    Disposed,
}

type ChangedHook = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type ResetHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// De-duplication table for one loader tier (§3.3): at most one in-flight
/// future per key. Installation generates a monotonic id so that, when the
/// owning future settles, it can verify its slot wasn't raced out from
/// under it before removing it (§4.3.2 "Cleanup").
struct ActiveTable<T: Clone + Send + 'static> {
    slots: DashMap<String, (u64, Shared<BoxFuture<'static, T>>)>,
    next_gen: AtomicU64,
}

impl<T: Clone + Send + 'static> ActiveTable<T> {
    fn new() -> Self {
        Self { slots: DashMap::new(), next_gen: AtomicU64::new(0) }
    }

    fn get(&self, key: &str) -> Option<Shared<BoxFuture<'static, T>>> {
        self.slots.get(key).map(|e| e.value().1.clone())
    }

    /// Returns the in-flight future for `key`, installing `make(gen)` as a
    /// new one if absent. The check-then-install happens inside a single
    /// `DashMap::entry` call, with no await in between (§5 "the mutation
    /// window... must be atomic").
    fn get_or_install(
        &self,
        key: &str,
        make: impl FnOnce(u64) -> BoxFuture<'static, T>,
    ) -> Shared<BoxFuture<'static, T>> {
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        self.slots.entry(key.to_string()).or_insert_with(|| (gen, make(gen).shared())).value().1.clone()
    }

    /// Called by the owning future once it settles. Logs (never panics or
    /// propagates) if the slot doesn't match — that would mean a second
    /// future was installed for the same key while one was still active, a
    /// bug in this module rather than caller error (§4.3.2, §4.3.5
    /// `QuantumCacheError`).
    fn complete(&self, cache: &str, key: &str, gen: u64) {
        let removed = self.slots.remove_if(key, |_, (g, _)| *g == gen);
        if removed.is_none() {
            tracing::error!(
                cache,
                key,
                gen,
                "active-fetch table race: settling future's slot was not its own"
            );
        }
    }
}

fn absorb_not_found<V>(result: Result<V>) -> Result<Option<V>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(QkvcError::KeyNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// The cluster-coherent cache (component C). Always held behind an `Arc`:
/// in-flight fetches are de-duplicated through shared, `'static` futures
/// that outlive any single caller's borrow of the cache.
pub struct QuantumCache<V> {
    name: String,
    store: MemoryStore<V>,
    loaders: LoaderSet<V>,
    bus: Arc<EventBus>,
    global_sem: Arc<Semaphore>,
    fetch_sem: Arc<Semaphore>,
    fetch_maybe_sem: Arc<Semaphore>,
    bulk_sem: Arc<Semaphore>,
    active_fetch: ActiveTable<Result<V>>,
    active_fetch_maybe: ActiveTable<Result<Option<V>>>,
    active_bulk: ActiveTable<Result<Option<V>>>,
    state: RwLock<State>,
    dispose_token: CancellationToken,
    on_changed: RwLock<Option<ChangedHook>>,
    on_reset: RwLock<Option<ResetHook>>,
    coherence_ids: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl<V: Clone + Send + Sync + 'static> QuantumCache<V> {
    /// Construct and wire the cache's coherence handlers onto `bus`. Both
    /// `quantumCacheUpdated` and `quantumCacheReset` are subscribed with
    /// `ignoreLocal: true`; the cache filters by `payload.name` internally
    /// since every cache shares the same two topic names (§4.3.4).
    #[must_use]
    pub fn new(opts: CacheOptions, loaders: LoaderSet<V>, bus: Arc<EventBus>) -> Arc<Self> {
        let cache = Arc::new(Self {
            name: opts.name().to_string(),
            store: MemoryStore::new(opts.lifetime()),
            loaders,
            bus,
            global_sem: Arc::new(Semaphore::new(opts.global_conc)),
            fetch_sem: Arc::new(Semaphore::new(opts.fetch_conc)),
            fetch_maybe_sem: Arc::new(Semaphore::new(opts.fetch_maybe_conc)),
            bulk_sem: Arc::new(Semaphore::new(opts.bulk_conc)),
            active_fetch: ActiveTable::new(),
            active_fetch_maybe: ActiveTable::new(),
            active_bulk: ActiveTable::new(),
            state: RwLock::new(State::Active),
            dispose_token: CancellationToken::new(),
            on_changed: RwLock::new(None),
            on_reset: RwLock::new(None),
            coherence_ids: Mutex::new(Vec::new()),
        });
        cache.wire_coherence();
        cache
    }

    fn wire_coherence(self: &Arc<Self>) {
        let this = self.clone();
        let id_updated =
            self.bus.on(TOPIC_UPDATED, HandlerOptions::ignore_local(), move |payload, _is_local| {
                let this = this.clone();
                async move { this.handle_remote_updated(payload).await }
            });
        let this = self.clone();
        let id_reset =
            self.bus.on(TOPIC_RESET, HandlerOptions::ignore_local(), move |payload, _is_local| {
                let this = this.clone();
                async move { this.handle_remote_reset(payload).await }
            });
        *self.coherence_ids.lock() = vec![(TOPIC_UPDATED, id_updated), (TOPIC_RESET, id_reset)];
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the `onChanged(keys)` hook (§3.1). Call after construction,
    /// once every cache it may reference (e.g. `userById` for the
    /// hibernation hook, §4.5.4) also exists.
    pub fn set_on_changed<F, Fut>(&self, hook: F)
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        *self.on_changed.write() = Some(Arc::new(move |keys| Box::pin(hook(keys))));
    }

    /// Register the `onReset()` hook (§3.1).
    pub fn set_on_reset<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        *self.on_reset.write() = Some(Arc::new(move || Box::pin(hook())));
    }

    fn check_active(&self) -> Result<()> {
        match *self.state.read() {
            State::Active => Ok(()),
            State::Disposing => Err(QkvcError::disposing(&self.name)),
            State::Disposed => Err(QkvcError::disposed(&self.name)),
        }
    }

    // ===== Read path (memory-only) =====

    pub fn get(&self, key: &str) -> Result<V> {
        self.store.get(key).ok_or_else(|| QkvcError::key_not_found(&self.name, key))
    }

    #[must_use]
    pub fn get_maybe(&self, key: &str) -> Option<V> {
        self.store.get(key)
    }

    #[must_use]
    pub fn get_many(&self, keys: &[String]) -> Vec<(String, Option<V>)> {
        keys.iter().map(|k| (k.clone(), self.store.get(k))).collect()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.store.has(key)
    }

    /// Every live, unexpired `(key, value)` pair currently resident. Used by
    /// invalidation rules that must scan a cache's contents rather than
    /// address it by key (e.g. finding which lists reference a given member,
    /// §4.5.3 `affectedLists`).
    #[must_use]
    pub fn entries(&self) -> Vec<(String, V)> {
        self.store.entries()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ===== Loader invocation (shared by fetch/fetchMaybe/fetchBulk tiers) =====

    async fn run_fetch_loader(&self, key: String) -> Result<V> {
        let _global = self.global_sem.clone().acquire_owned().await.expect("semaphore is never closed");
        let _tier = self.fetch_sem.clone().acquire_owned().await.expect("semaphore is never closed");
        let ctx = LoaderContext { cache: self.name.clone(), dispose_signal: self.dispose_token.clone() };
        let fetch_fn = self.loaders.fetch.clone();
        let key_for_task = key.clone();
        let handle = tokio::spawn(async move { fetch_fn(key_for_task, ctx).await });
        let result = tokio::select! {
            biased;
            _ = self.dispose_token.cancelled() => Err(QkvcError::aborted(&self.name, &key)),
            joined = handle => match joined {
                Ok(Ok(Some(value))) => Ok(value),
                Ok(Ok(None)) => Err(QkvcError::key_not_found(&self.name, &key)),
                Ok(Err(cause)) => Err(QkvcError::fetch_failed(&self.name, &key, vec![cause])),
                Err(join_err) => Err(QkvcError::fetch_failed(&self.name, &key, vec![join_err.to_string()])),
            },
        };
        if let Ok(ref value) = result {
            self.store.set(key.clone(), value.clone(), None);
        }
        result
    }

    async fn run_fetch_maybe_loader(&self, key: String) -> Result<Option<V>> {
        let _global = self.global_sem.clone().acquire_owned().await.expect("semaphore is never closed");
        let _tier =
            self.fetch_maybe_sem.clone().acquire_owned().await.expect("semaphore is never closed");
        let ctx = LoaderContext { cache: self.name.clone(), dispose_signal: self.dispose_token.clone() };
        let fetch_maybe_fn =
            self.loaders.fetch_maybe.clone().expect("caller already checked has_fetch_maybe");
        let key_for_task = key.clone();
        let handle = tokio::spawn(async move { fetch_maybe_fn(key_for_task, ctx).await });
        let result = tokio::select! {
            biased;
            _ = self.dispose_token.cancelled() => Err(QkvcError::aborted(&self.name, &key)),
            joined = handle => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(cause)) => Err(QkvcError::fetch_failed(&self.name, &key, vec![cause])),
                Err(join_err) => Err(QkvcError::fetch_failed(&self.name, &key, vec![join_err.to_string()])),
            },
        };
        if let Ok(Some(ref value)) = result {
            self.store.set(key.clone(), value.clone(), None);
        }
        result
    }

    async fn run_bulk_loader(&self, keys: Vec<String>) -> Result<Vec<(String, V)>> {
        let _global = self.global_sem.clone().acquire_owned().await.expect("semaphore is never closed");
        let _tier = self.bulk_sem.clone().acquire_owned().await.expect("semaphore is never closed");
        let ctx = LoaderContext { cache: self.name.clone(), dispose_signal: self.dispose_token.clone() };
        let bulk_fn = self.loaders.fetch_bulk.clone().expect("caller already checked has_fetch_bulk");
        let handle = tokio::spawn(async move { bulk_fn(keys, ctx).await });
        let result = tokio::select! {
            biased;
            _ = self.dispose_token.cancelled() => Err(QkvcError::aborted(&self.name, "<bulk>")),
            joined = handle => match joined {
                Ok(Ok(pairs)) => Ok(pairs),
                Ok(Err(cause)) => Err(QkvcError::fetch_failed(&self.name, "<bulk>", vec![cause])),
                Err(join_err) => {
                    Err(QkvcError::fetch_failed(&self.name, "<bulk>", vec![join_err.to_string()]))
                }
            },
        };
        if let Ok(ref pairs) = result {
            for (k, v) in pairs {
                self.store.set(k.clone(), v.clone(), None);
            }
        }
        result
    }

    /// Installs one shared bulk-loader invocation for `keys`, registering a
    /// per-key view of it in the bulk active-fetch table (§3.3 "Bulk
    /// fetches register an entry for every key they cover").
    fn install_bulk(
        self: &Arc<Self>,
        keys: Vec<String>,
    ) -> Vec<(String, Shared<BoxFuture<'static, Result<Option<V>>>>)> {
        let shared_bulk: Shared<BoxFuture<'static, Result<Vec<(String, V)>>>> = {
            let this = self.clone();
            let keys = keys.clone();
            async move { this.run_bulk_loader(keys).await }.boxed().shared()
        };
        keys.into_iter()
            .map(|key| {
                let shared = {
                    let shared_bulk = shared_bulk.clone();
                    let this = self.clone();
                    let key_owned = key.clone();
                    self.active_bulk.get_or_install(&key, move |gen| {
                        Box::pin(async move {
                            let result = match shared_bulk.await {
                                Ok(pairs) => {
                                    Ok(pairs.into_iter().find(|(k, _)| *k == key_owned).map(|(_, v)| v))
                                }
                                Err(e) => Err(e),
                            };
                            this.active_bulk.complete(&this.name, &key_owned, gen);
                            result
                        })
                    })
                };
                (key, shared)
            })
            .collect()
    }

    // ===== Fetch tiers (de-duplicated) =====

    pub async fn fetch(self: &Arc<Self>, key: impl Into<String>) -> Result<V> {
        let key = key.into();
        self.check_active()?;
        if let Some(v) = self.store.get(&key) {
            return Ok(v);
        }
        let shared = {
            let this = self.clone();
            let key_owned = key.clone();
            self.active_fetch.get_or_install(&key, move |gen| {
                Box::pin(async move {
                    let result = this.run_fetch_loader(key_owned.clone()).await;
                    this.active_fetch.complete(&this.name, &key_owned, gen);
                    result
                })
            })
        };
        shared.await
    }

    pub async fn fetch_maybe(self: &Arc<Self>, key: impl Into<String>) -> Result<Option<V>> {
        let key = key.into();
        self.check_active()?;
        if let Some(v) = self.store.get(&key) {
            return Ok(Some(v));
        }
        if let Some(shared) = self.active_fetch_maybe.get(&key) {
            return shared.await;
        }
        if let Some(shared) = self.active_fetch.get(&key) {
            return absorb_not_found(shared.await);
        }
        if self.loaders.has_fetch_maybe() {
            let shared = {
                let this = self.clone();
                let key_owned = key.clone();
                self.active_fetch_maybe.get_or_install(&key, move |gen| {
                    Box::pin(async move {
                        let result = this.run_fetch_maybe_loader(key_owned.clone()).await;
                        this.active_fetch_maybe.complete(&this.name, &key_owned, gen);
                        result
                    })
                })
            };
            return shared.await;
        }
        let shared = {
            let this = self.clone();
            let key_owned = key.clone();
            self.active_fetch.get_or_install(&key, move |gen| {
                Box::pin(async move {
                    let result = this.run_fetch_loader(key_owned.clone()).await;
                    this.active_fetch.complete(&this.name, &key_owned, gen);
                    result
                })
            })
        };
        absorb_not_found(shared.await)
    }

    /// Dedups against every in-flight tier; the `remaining` keys after that
    /// trigger one bulk fetch when a bulk loader is configured and more than
    /// one key remains, else an individual `fetchMaybe` each (§4.3.2.3, §5
    /// "Back-pressure"). Errors across all component futures are aggregated
    /// into one `FetchFailed`; missing keys are silently dropped.
    pub async fn fetch_many(self: &Arc<Self>, keys: Vec<String>) -> Result<Vec<(String, V)>> {
        self.check_active()?;
        let mut results: Vec<(String, V)> = Vec::new();
        let mut joined: Vec<BoxFuture<'static, (String, Result<Option<V>>)>> = Vec::new();
        let mut remaining: Vec<String> = Vec::new();

        for key in keys {
            if let Some(v) = self.store.get(&key) {
                results.push((key, v));
                continue;
            }
            if let Some(shared) = self.active_fetch_maybe.get(&key) {
                let k = key.clone();
                joined.push(Box::pin(async move { (k, shared.await) }));
                continue;
            }
            if let Some(shared) = self.active_fetch.get(&key) {
                let k = key.clone();
                joined.push(Box::pin(async move { (k, absorb_not_found(shared.await)) }));
                continue;
            }
            if let Some(shared) = self.active_bulk.get(&key) {
                let k = key.clone();
                joined.push(Box::pin(async move { (k, shared.await) }));
                continue;
            }
            remaining.push(key);
        }

        if self.loaders.has_fetch_bulk() && remaining.len() > 1 {
            for (key, shared) in self.install_bulk(remaining) {
                joined.push(Box::pin(async move { (key, shared.await) }));
            }
        } else {
            for key in remaining {
                let this = self.clone();
                joined.push(Box::pin(async move {
                    let result = this.fetch_maybe(key.clone()).await;
                    (key, result)
                }));
            }
        }

        let settled = futures::future::join_all(joined).await;
        let mut causes = Vec::new();
        for (key, result) in settled {
            match result {
                Ok(Some(v)) => results.push((key, v)),
                Ok(None) => {}
                Err(e) => causes.push(e.to_string()),
            }
        }
        if !causes.is_empty() {
            return Err(QkvcError::fetch_failed(&self.name, "<bulk>", causes));
        }
        Ok(results)
    }

    // ===== Refresh (bypass memory, reload, no coherence emission) =====

    /// Forces a fresh loader call, bypassing both memory and the
    /// active-fetch tables, and updates memory from the result.
    /// `refresh*` never emits a coherence event (§8.1 "Emission parity":
    /// `add`/`addMany`/`fetch`/`refresh*` emit zero).
    pub async fn refresh(self: &Arc<Self>, key: impl Into<String>) -> Result<V> {
        let key = key.into();
        self.check_active()?;
        let result = self.run_fetch_loader(key.clone()).await;
        if let Err(QkvcError::KeyNotFound { .. }) = &result {
            self.store.delete(&key);
        }
        result
    }

    pub async fn refresh_maybe(self: &Arc<Self>, key: impl Into<String>) -> Result<Option<V>> {
        let key = key.into();
        self.check_active()?;
        let result = if self.loaders.has_fetch_maybe() {
            self.run_fetch_maybe_loader(key.clone()).await
        } else {
            absorb_not_found(self.run_fetch_loader(key.clone()).await)
        };
        if let Ok(None) = &result {
            self.store.delete(&key);
        }
        result
    }

    pub async fn refresh_many(self: &Arc<Self>, keys: Vec<String>) -> Result<Vec<(String, V)>> {
        self.check_active()?;
        let futures = keys.into_iter().map(|key| {
            let this = self.clone();
            async move {
                let result = this.refresh_maybe(key.clone()).await;
                (key, result)
            }
        });
        let settled = futures::future::join_all(futures).await;
        let mut out = Vec::new();
        let mut causes = Vec::new();
        for (key, result) in settled {
            match result {
                Ok(Some(v)) => out.push((key, v)),
                Ok(None) => {}
                Err(e) => causes.push(e.to_string()),
            }
        }
        if !causes.is_empty() {
            return Err(QkvcError::fetch_failed(&self.name, "<bulk>", causes));
        }
        Ok(out)
    }

    // ===== Write path =====

    async fn invoke_on_changed(&self, keys: Vec<String>) -> Result<()> {
        let hook = self.on_changed.read().clone();
        match hook {
            Some(hook) => hook(keys).await,
            None => Ok(()),
        }
    }

    async fn invoke_on_reset(&self) -> Result<()> {
        let hook = self.on_reset.read().clone();
        match hook {
            Some(hook) => hook().await,
            None => Ok(()),
        }
    }

    async fn emit_updated(&self, keys: Vec<String>) {
        self.bus.emit(TOPIC_UPDATED, serde_json::json!({"name": self.name, "keys": keys}), true).await;
    }

    /// Insert or replace `key`. Always emits (the "skip if the stored
    /// reference is identical to prior" optimization in §4.3.1 is a
    /// reference-identity check that doesn't translate to owned Rust
    /// values; omitted — see design notes).
    pub async fn set(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.check_active()?;
        let key = key.into();
        self.store.set(key.clone(), value, None);
        self.invoke_on_changed(vec![key.clone()]).await?;
        self.emit_updated(vec![key]).await;
        Ok(())
    }

    /// One coherence event for every key in `entries`; a no-op (no event)
    /// if `entries` is empty.
    pub async fn set_many(&self, entries: Vec<(String, V)>) -> Result<()> {
        self.check_active()?;
        if entries.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
        for (k, v) in entries {
            self.store.set(k, v, None);
        }
        self.invoke_on_changed(keys.clone()).await?;
        self.emit_updated(keys).await;
        Ok(())
    }

    /// Memory-only insert: no coherence event, no `onChanged`. For
    /// installing freshly authoritative data (e.g. right after a DB
    /// insert) where peers have nothing to invalidate yet.
    pub async fn add(&self, key: impl Into<String>, value: V) -> Result<()> {
        self.check_active()?;
        self.store.set(key.into(), value, None);
        Ok(())
    }

    pub async fn add_many(&self, entries: Vec<(String, V)>) -> Result<()> {
        self.check_active()?;
        for (k, v) in entries {
            self.store.set(k, v, None);
        }
        Ok(())
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<()> {
        self.check_active()?;
        let key = key.into();
        self.store.delete(&key);
        self.invoke_on_changed(vec![key.clone()]).await?;
        self.emit_updated(vec![key]).await;
        Ok(())
    }

    pub async fn delete_many(&self, keys: Vec<String>) -> Result<()> {
        self.check_active()?;
        if keys.is_empty() {
            return Ok(());
        }
        for key in &keys {
            self.store.delete(key);
        }
        self.invoke_on_changed(keys.clone()).await?;
        self.emit_updated(keys).await;
        Ok(())
    }

    /// Local memory wipe only; does not emit and does not invoke `onReset`.
    pub fn clear(&self) -> Result<()> {
        self.check_active()?;
        self.store.clear();
        Ok(())
    }

    /// Local wipe, `onReset` invoked directly (errors propagate to the
    /// caller), then `quantumCacheReset` published for peers.
    pub async fn reset(&self) -> Result<()> {
        self.check_active()?;
        self.store.clear();
        self.invoke_on_reset().await?;
        self.bus.emit(TOPIC_RESET, serde_json::json!({"name": self.name}), true).await;
        Ok(())
    }

    #[must_use]
    pub fn gc(&self) -> usize {
        self.store.gc()
    }

    /// Mutates the stored value for `key` in place, touching neither its
    /// expiry nor coherence (§4.5.4 hibernation hook, §9 "shared-reference
    /// mutation" — the underlying store's interior mutability makes true
    /// in-place mutation safe here, unlike languages where the hook has to
    /// fall back to a coherence-free replacement). Returns `false` if the
    /// key is absent or already expired.
    pub fn update_in_place(&self, key: &str, f: impl FnOnce(&mut V)) -> Result<bool> {
        self.check_active()?;
        Ok(self.store.update_in_place(key, f))
    }

    // ===== Coherence receive path (remote frames only; ignoreLocal: true) =====

    async fn handle_remote_updated(&self, payload: serde_json::Value) -> Result<()> {
        let name = payload.get("name").and_then(serde_json::Value::as_str).unwrap_or_default();
        if name != self.name {
            return Ok(());
        }
        let keys: Vec<String> = payload
            .get("keys")
            .and_then(serde_json::Value::as_array)
            .map(|arr| arr.iter().filter_map(|k| k.as_str().map(String::from)).collect())
            .unwrap_or_default();
        for key in &keys {
            self.store.delete(key);
        }
        if let Err(err) = self.invoke_on_changed(keys).await {
            tracing::warn!(cache = %self.name, error = %err, "onChanged failed for remote invalidation");
        }
        Ok(())
    }

    async fn handle_remote_reset(&self, payload: serde_json::Value) -> Result<()> {
        let name = payload.get("name").and_then(serde_json::Value::as_str).unwrap_or_default();
        if name != self.name {
            return Ok(());
        }
        self.store.clear();
        if let Err(err) = self.invoke_on_reset().await {
            tracing::warn!(cache = %self.name, error = %err, "onReset failed for remote reset");
        }
        Ok(())
    }

    // ===== Lifecycle =====

    /// Idempotent. Enters `Disposing` (new calls fail fast with
    /// *Disposing*), unregisters coherence handlers, cancels the dispose
    /// token so every loader race loses to *Aborted*, waits for all
    /// in-flight futures to settle, then enters `Disposed` and purges
    /// memory.
    pub async fn dispose(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if *state != State::Active {
                return;
            }
            *state = State::Disposing;
        }
        for (topic, id) in self.coherence_ids.lock().drain(..) {
            self.bus.off(topic, id);
        }
        self.dispose_token.cancel();

        let pending: Vec<BoxFuture<'static, ()>> = self
            .active_fetch
            .slots
            .iter()
            .map(|e| e.value().1.clone())
            .map(|f| Box::pin(async move { drop(f.await) }) as BoxFuture<'static, ()>)
            .chain(
                self.active_fetch_maybe
                    .slots
                    .iter()
                    .map(|e| e.value().1.clone())
                    .map(|f| Box::pin(async move { drop(f.await) }) as BoxFuture<'static, ()>),
            )
            .chain(
                self.active_bulk
                    .slots
                    .iter()
                    .map(|e| e.value().1.clone())
                    .map(|f| Box::pin(async move { drop(f.await) }) as BoxFuture<'static, ()>),
            )
            .collect();
        futures::future::join_all(pending).await;

        *self.state.write() = State::Disposed;
        self.store.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests can use unwrap for simplicity
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    use proptest::prelude::*;

    use crate::bus::transport::InMemoryClusterTransport;
    use crate::cache::loader::LoaderSet;

    use super::*;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(Arc::new(InMemoryClusterTransport::default()), "proc-a"))
    }

    fn cache_with_loader(calls: Arc<AtomicUsize>) -> Arc<QuantumCache<String>> {
        let loaders = LoaderSet::new(move |key: String, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(Some(format!("v#{key}")))
            }
        });
        QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus())
    }

    // ===== Memory-only read path =====

    #[tokio::test]
    async fn test_get_absent_key_fails_key_not_found() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        let err = cache.get("x").unwrap_err();
        assert_eq!(err.error_code(), "key_not_found");
    }

    #[tokio::test]
    async fn test_get_maybe_absent_key_returns_none() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        assert_eq!(cache.get_maybe("x"), None);
    }

    // ===== fetch =====

    #[tokio::test]
    async fn test_fetch_populates_memory_on_miss() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        let v = cache.fetch("k").await.unwrap();
        assert_eq!(v, "v#k");
        assert_eq!(cache.get("k").unwrap(), "v#k");
    }

    #[tokio::test]
    async fn test_fetch_does_not_re_invoke_loader_once_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = cache_with_loader(calls.clone());
        cache.fetch("k").await.unwrap();
        cache.fetch("k").await.unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_on_missing_key_loader_fails_key_not_found() {
        let loaders: LoaderSet<String> = LoaderSet::new(|_key, _ctx| async { Ok(None) });
        let cache = QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());
        let err = cache.fetch("missing").await.unwrap_err();
        assert_eq!(err.error_code(), "key_not_found");
    }

    #[tokio::test]
    async fn test_fetch_loader_error_becomes_fetch_failed() {
        let loaders: LoaderSet<String> =
            LoaderSet::new(|_key, _ctx| async { Err("db exploded".to_string()) });
        let cache = QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());
        let err = cache.fetch("k").await.unwrap_err();
        assert_eq!(err.error_code(), "fetch_failed");
        assert!(err.to_string().contains("db exploded"));
    }

    // ===== De-duplication (§8.2 scenario 4) =====

    #[tokio::test]
    async fn test_concurrent_fetch_calls_invoke_loader_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        // The loader sleeps briefly so the second `fetch` call has a window
        // to join the first one's in-flight future instead of racing ahead
        // of it; de-duplication means the loader only ever runs once no
        // matter how this interleaves.
        let loaders = {
            let calls = calls.clone();
            LoaderSet::new(move |key: String, _ctx| {
                let calls = calls.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    calls.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(Some(format!("v#{key}")))
                }
            })
        };
        let cache =
            QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { c1.fetch("x").await }),
            tokio::spawn(async move { c2.fetch("x").await }),
        );
        assert_eq!(r1.unwrap().unwrap(), "v#x");
        assert_eq!(r2.unwrap().unwrap(), "v#x");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    // ===== fetchMaybe fallback chain =====

    #[tokio::test]
    async fn test_fetch_maybe_without_loader_falls_back_to_fetch_and_absorbs_not_found() {
        let loaders: LoaderSet<String> = LoaderSet::new(|_key, _ctx| async { Ok(None) });
        let cache = QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());
        assert_eq!(cache.fetch_maybe("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_maybe_joins_existing_fetch_future() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loaders = {
            let calls = calls.clone();
            LoaderSet::new(move |key: String, _ctx| {
                let calls = calls.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    calls.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(Some(format!("v#{key}")))
                }
            })
        };
        let cache =
            QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());

        let c1 = cache.clone();
        let c2 = cache.clone();
        let (fetch_result, maybe_result) = tokio::join!(
            tokio::spawn(async move { c1.fetch("x").await }),
            tokio::spawn(async move { c2.fetch_maybe("x").await }),
        );
        assert_eq!(fetch_result.unwrap().unwrap(), "v#x");
        assert_eq!(maybe_result.unwrap().unwrap(), Some("v#x".to_string()));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    // ===== Bulk vs single fallback (§8.2 scenario 5) =====

    #[tokio::test]
    async fn test_fetch_many_prefers_bulk_loader_for_multiple_missing_keys() {
        let bulk_calls = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let maybe_calls = Arc::new(AtomicUsize::new(0));
        let loaders = {
            let bulk_calls = bulk_calls.clone();
            let maybe_calls = maybe_calls.clone();
            LoaderSet::new(|_key: String, _ctx| async { Ok(None) })
                .with_fetch_maybe(move |_key, _ctx| {
                    let maybe_calls = maybe_calls.clone();
                    async move {
                        maybe_calls.fetch_add(1, AtomicOrdering::SeqCst);
                        Ok(None)
                    }
                })
                .with_fetch_bulk(move |keys: Vec<String>, _ctx| {
                    let bulk_calls = bulk_calls.clone();
                    async move {
                        bulk_calls.lock().push(keys.clone());
                        Ok(keys.into_iter().map(|k| (k.clone(), format!("v#{k}"))).collect())
                    }
                })
        };
        let cache =
            QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());
        cache.add("a", "vA".to_string()).await.unwrap();

        let mut result = cache.fetch_many(vec!["a".into(), "b".into(), "c".into()]).await.unwrap();
        result.sort();
        assert_eq!(
            result,
            vec![
                ("a".to_string(), "vA".to_string()),
                ("b".to_string(), "v#b".to_string()),
                ("c".to_string(), "v#c".to_string()),
            ]
        );
        assert_eq!(bulk_calls.lock().len(), 1);
        let mut bulk_keys = bulk_calls.lock()[0].clone();
        bulk_keys.sort();
        assert_eq!(bulk_keys, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(maybe_calls.load(AtomicOrdering::SeqCst), 0);
    }

    // ===== Write path / emission =====

    #[tokio::test]
    async fn test_set_then_get_read_after_write() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        cache.set("k", "v".to_string()).await.unwrap();
        assert_eq!(cache.get("k").unwrap(), "v");
    }

    #[tokio::test]
    async fn test_add_does_not_invoke_on_changed() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        cache.set_on_changed(move |_keys| {
            let called = called2.clone();
            async move {
                called.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        cache.add("k", "v".to_string()).await.unwrap();
        assert_eq!(called.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_invokes_on_changed() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        cache.set_on_changed(move |keys| {
            let called = called2.clone();
            async move {
                assert_eq!(keys, vec!["k".to_string()]);
                called.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        cache.add("k", "v".to_string()).await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(called.load(AtomicOrdering::SeqCst), 1);
        assert!(cache.get_maybe("k").is_none());
    }

    #[tokio::test]
    async fn test_on_changed_error_propagates_to_caller_of_local_delete() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        cache.set_on_changed(|_keys| async { Err(QkvcError::internal("hook blew up")) });
        cache.add("k", "v".to_string()).await.unwrap();
        let err = cache.delete("k").await.unwrap_err();
        assert_eq!(err.error_code(), "internal");
    }

    #[tokio::test]
    async fn test_set_many_is_a_no_op_for_empty_entries() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        cache.set_many(vec![]).await.unwrap();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_memory_and_invokes_on_reset() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        cache.add("k", "v".to_string()).await.unwrap();
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        cache.set_on_reset(move || {
            let called = called2.clone();
            async move {
                called.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
        });
        cache.reset().await.unwrap();
        assert_eq!(called.load(AtomicOrdering::SeqCst), 1);
        assert!(cache.is_empty());
    }

    // ===== Coherence round trip across two caches sharing a transport =====

    #[tokio::test]
    async fn test_peer_receives_quantum_cache_updated_and_evicts() {
        let transport = Arc::new(InMemoryClusterTransport::default());
        let bus_a = Arc::new(EventBus::new(transport.clone(), "proc-a"));
        let bus_b = Arc::new(EventBus::new(transport, "proc-b"));
        let _receiver_b = bus_b.clone().spawn_receiver().unwrap();

        let loaders_a: LoaderSet<String> = LoaderSet::new(|_k, _ctx| async { Ok(Some("irrelevant".into())) });
        let loaders_b: LoaderSet<String> = LoaderSet::new(|_k, _ctx| async { Ok(Some("irrelevant".into())) });
        let cache_a =
            QuantumCache::new(CacheOptions::new("shared", Duration::from_secs(60)), loaders_a, bus_a);
        let cache_b =
            QuantumCache::new(CacheOptions::new("shared", Duration::from_secs(60)), loaders_b, bus_b);

        cache_b.add("k", "stale".to_string()).await.unwrap();
        assert_eq!(cache_b.get_maybe("k"), Some("stale".to_string()));

        cache_a.add("k", "fresh".to_string()).await.unwrap();
        cache_a.delete("k").await.unwrap();

        for _ in 0..50 {
            if cache_b.get_maybe("k").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cache_b.get_maybe("k").is_none());
    }

    // ===== Dispose (§8.2 scenario 6) =====

    #[tokio::test]
    async fn test_dispose_rejects_new_calls() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        cache.dispose().await;
        let err = cache.fetch("k").await.unwrap_err();
        assert_eq!(err.error_code(), "disposed");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let cache = cache_with_loader(Arc::new(AtomicUsize::new(0)));
        cache.dispose().await;
        cache.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_aborts_in_flight_fetch() {
        let loaders: LoaderSet<String> = LoaderSet::new(|_key, ctx| async move {
            ctx.dispose_signal.cancelled().await;
            // Simulate a loader that keeps going after losing the race;
            // its result must be discarded by the caller's view.
            Ok(Some("too-late".to_string()))
        });
        let cache =
            QuantumCache::new(CacheOptions::new("test", Duration::from_secs(60)), loaders, bus());

        let c = cache.clone();
        let fetch_task = tokio::spawn(async move { c.fetch("k").await });
        tokio::task::yield_now().await;
        cache.dispose().await;

        let result = fetch_task.await.unwrap();
        assert_eq!(result.unwrap_err().error_code(), "aborted");
        assert!(cache.is_empty());
    }

    // ===== Concurrency-bound property (§8.1) =====

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn prop_fetch_concurrency_never_exceeds_configured_limit(
            limit in 1usize..=4,
            key_count in 1usize..=12,
        ) {
            let rt = tokio::runtime::Runtime::new().expect("runtime starts");
            let peak = rt.block_on(async {
                let current = Arc::new(AtomicUsize::new(0));
                let peak = Arc::new(AtomicUsize::new(0));
                let current_for_loader = current.clone();
                let peak_for_loader = peak.clone();
                let loaders = LoaderSet::new(move |key: String, _ctx| {
                    let current = current_for_loader.clone();
                    let peak = peak_for_loader.clone();
                    async move {
                        let now = current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                        peak.fetch_max(now, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        current.fetch_sub(1, AtomicOrdering::SeqCst);
                        Ok(Some(format!("v#{key}")))
                    }
                });
                let cache = QuantumCache::new(
                    CacheOptions::new("test", Duration::from_secs(60))
                        .with_fetch_conc(limit)
                        .with_global_conc(limit),
                    loaders,
                    bus(),
                );
                let handles: Vec<_> = (0..key_count)
                    .map(|i| {
                        let cache = cache.clone();
                        tokio::spawn(async move { cache.fetch(format!("k{i}")).await })
                    })
                    .collect();
                for h in handles {
                    h.await.expect("task doesn't panic").expect("fetch succeeds");
                }
                peak.load(AtomicOrdering::SeqCst)
            });
            prop_assert!(peak <= limit);
        }
    }
}
