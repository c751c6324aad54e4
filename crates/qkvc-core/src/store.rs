//! Memory KV Store (component B): per-key value + expiry, no event emission.
//!
//! [`crate::cache::QuantumCache`] is the only consumer; nothing outside this
//! crate gets a handle to a [`MemoryStore`] directly.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A concurrent map from opaque string keys to `(value, expiresAt)` pairs.
///
/// Expiry is checked lazily on read: an entry past its `expiresAt` is treated
/// as absent and removed on the read that discovers it (§3.2).
pub struct MemoryStore<V> {
    entries: DashMap<String, Entry<V>>,
    lifetime: Duration,
}

impl<V: Clone> MemoryStore<V> {
    #[must_use]
    pub fn new(lifetime: Duration) -> Self {
        Self { entries: DashMap::new(), lifetime }
    }

    /// Returns the value if present and unexpired, lazily dropping it
    /// otherwise.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let hit = self.entries.get(key).filter(|e| e.expires_at > now).map(|e| e.value.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        hit
    }

    /// `true` if `key` has a present, unexpired entry.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace `key`, expiring at `now + lifetime` unless
    /// `expires_at` overrides it.
    pub fn set(&self, key: impl Into<String>, value: V, expires_at: Option<Instant>) {
        let expires_at = expires_at.unwrap_or_else(|| Instant::now() + self.lifetime);
        self.entries.insert(key.into(), Entry { value, expires_at });
    }

    /// Removes `key`, returning whether an entry was actually present
    /// (expired entries count as absent).
    pub fn delete(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, e)) => e.expires_at > Instant::now(),
            None => false,
        }
    }

    /// Number of entries, including expired-but-not-yet-collected ones.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Live, unexpired `(key, value)` pairs. Does not evict expired entries
    /// as a side effect — call [`gc`](Self::gc) for that.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| (e.key().clone(), e.value.value.clone()))
            .collect()
    }

    /// Local wipe, no expiry bookkeeping.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Evicts every expired entry, returning how many were removed.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    /// Mutates the stored value in place without touching its expiry,
    /// returning `false` if the key is absent or already expired. Used by
    /// the hibernation hook (§4.5.4, §9 shared-reference mutation) to patch
    /// a denormalized field on an authoritative entity without a full
    /// `set`/coherence round trip.
    pub fn update_in_place(&self, key: &str, f: impl FnOnce(&mut V)) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut e) if e.expires_at > now => {
                f(&mut e.value);
                true
            }
            _ => false,
        }
    }
}

/// A plain, independently-TTL'd cache with no cluster coherence and no
/// loader pipeline (§4.4 `createMemory`) — just the named [`MemoryStore`]
/// contract exposed to callers outside this crate.
pub struct MemoryCache<V> {
    name: String,
    store: MemoryStore<V>,
}

impl<V: Clone> MemoryCache<V> {
    pub(crate) fn new(name: impl Into<String>, lifetime: Duration) -> Self {
        Self { name: name.into(), store: MemoryStore::new(lifetime) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.store.get(key)
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.store.has(key)
    }

    pub fn set(&self, key: impl Into<String>, value: V, expires_at: Option<Instant>) {
        self.store.set(key, value, expires_at);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.store.delete(key)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.store.size()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(String, V)> {
        self.store.entries()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn gc(&self) -> usize {
        self.store.gc()
    }
}
