//! Configuration for individual caches and the registry that owns them.

use std::time::Duration;

/// Per-cache tuning: name, entry lifetime, and the four concurrency limits
/// described in §4.3.3 (one per loader tier, plus a global ceiling).
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub(crate) name: String,
    pub(crate) lifetime: Duration,
    pub(crate) fetch_conc: usize,
    pub(crate) fetch_maybe_conc: usize,
    pub(crate) bulk_conc: usize,
    pub(crate) global_conc: usize,
}

impl CacheOptions {
    /// Start from a name and lifetime with the spec's defaults: `fetchConc`
    /// 4, `fetchMaybeConc` 4, `bulkConc` 2, `globalConc` = max of the three.
    #[must_use]
    pub fn new(name: impl Into<String>, lifetime: Duration) -> Self {
        let fetch_conc = 4;
        let fetch_maybe_conc = 4;
        let bulk_conc = 2;
        Self {
            name: name.into(),
            lifetime,
            fetch_conc,
            fetch_maybe_conc,
            bulk_conc,
            global_conc: fetch_conc.max(fetch_maybe_conc).max(bulk_conc),
        }
    }

    #[must_use]
    pub fn with_fetch_conc(mut self, n: usize) -> Self {
        self.fetch_conc = n.max(1);
        self
    }

    #[must_use]
    pub fn with_fetch_maybe_conc(mut self, n: usize) -> Self {
        self.fetch_maybe_conc = n.max(1);
        self
    }

    #[must_use]
    pub fn with_bulk_conc(mut self, n: usize) -> Self {
        self.bulk_conc = n.max(1);
        self
    }

    #[must_use]
    pub fn with_global_conc(mut self, n: usize) -> Self {
        self.global_conc = n.max(1);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }
}

/// Options owned by the [`crate::registry::CacheRegistry`]: the identity
/// this process stamps onto outgoing coherence frames, and the locally
/// configured host used to null-normalize accts (§4.5.2).
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub(crate) process_id: String,
    pub(crate) local_host: Option<String>,
}

impl RegistryOptions {
    #[must_use]
    pub fn new(process_id: impl Into<String>, local_host: impl Into<String>) -> Self {
        Self { process_id: process_id.into(), local_host: Some(local_host.into()) }
    }

    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    #[must_use]
    pub fn local_host(&self) -> Option<&str> {
        self.local_host.as_deref()
    }
}

impl Default for RegistryOptions {
    /// A fresh process id and no configured host (every host counts as
    /// remote), overridable with `QKVC_PROCESS_ID` / `QKVC_LOCAL_HOST`.
    fn default() -> Self {
        let process_id =
            std::env::var("QKVC_PROCESS_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let local_host = std::env::var("QKVC_LOCAL_HOST").ok();
        Self { process_id, local_host }
    }
}
