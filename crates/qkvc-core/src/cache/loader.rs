//! The pluggable loader functions a [`super::QuantumCache`] is built from
//! (§6.2), and the context object passed to every loader invocation (§6.3).

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// `{ cache: <the cache instance>, disposeSignal: <AbortSignal> }` (§6.3).
/// Loaders that want to honor cancellation check `ctx.dispose_signal` at
/// their own await points; the cache wraps every invocation in a race
/// against the same token regardless, so an unresponsive loader's eventual
/// result is simply discarded rather than awaited forever (§4.3.3).
#[derive(Clone)]
pub struct LoaderContext {
    pub cache: String,
    pub dispose_signal: CancellationToken,
}

type FetchFn<V> = Arc<dyn Fn(String, LoaderContext) -> BoxFuture<'static, Result<Option<V>, String>> + Send + Sync>;
type BulkFn<V> = Arc<
    dyn Fn(Vec<String>, LoaderContext) -> BoxFuture<'static, Result<Vec<(String, V)>, String>> + Send + Sync,
>;

/// The `fetch`/`fetchMaybe`/`fetchBulk` functions a cache consults on miss.
/// `fetch` is mandatory; `fetchMaybe` and `fetchBulk` are optional
/// optimizations the de-duplication logic in [`super::quantum`] takes
/// advantage of when present (§4.3.2).
///
/// A loader returns `Ok(None)` for "key does not exist" and `Err(_)` for an
/// actual failure; `fetch` turns `Ok(None)` into *KeyNotFound*, `fetchMaybe`
/// turns it into an absent result, and either turns `Err(_)` into
/// *FetchFailed* (§4.3.5).
#[derive(Clone)]
pub struct LoaderSet<V> {
    pub(super) fetch: FetchFn<V>,
    pub(super) fetch_maybe: Option<FetchFn<V>>,
    pub(super) fetch_bulk: Option<BulkFn<V>>,
}

impl<V: Clone + Send + Sync + 'static> LoaderSet<V> {
    /// Construct from the mandatory `fetch` loader alone.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(String, LoaderContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<V>, String>> + Send + 'static,
    {
        Self {
            fetch: Arc::new(move |key, ctx| Box::pin(fetch(key, ctx))),
            fetch_maybe: None,
            fetch_bulk: None,
        }
    }

    #[must_use]
    pub fn with_fetch_maybe<F, Fut>(mut self, fetch_maybe: F) -> Self
    where
        F: Fn(String, LoaderContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<V>, String>> + Send + 'static,
    {
        self.fetch_maybe = Some(Arc::new(move |key, ctx| Box::pin(fetch_maybe(key, ctx))));
        self
    }

    #[must_use]
    pub fn with_fetch_bulk<F, Fut>(mut self, fetch_bulk: F) -> Self
    where
        F: Fn(Vec<String>, LoaderContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Vec<(String, V)>, String>> + Send + 'static,
    {
        self.fetch_bulk = Some(Arc::new(move |keys, ctx| Box::pin(fetch_bulk(keys, ctx))));
        self
    }

    pub(super) fn has_fetch_maybe(&self) -> bool {
        self.fetch_maybe.is_some()
    }

    pub(super) fn has_fetch_bulk(&self) -> bool {
        self.fetch_bulk.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests can use unwrap for simplicity
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_only_loader_set_reports_no_optional_tiers() {
        let loaders: LoaderSet<i32> = LoaderSet::new(|_key, _ctx| async { Ok(Some(1)) });
        assert!(!loaders.has_fetch_maybe());
        assert!(!loaders.has_fetch_bulk());
    }

    #[tokio::test]
    async fn test_with_fetch_maybe_and_bulk_are_recorded() {
        let loaders: LoaderSet<i32> = LoaderSet::new(|_key, _ctx| async { Ok(Some(1)) })
            .with_fetch_maybe(|_key, _ctx| async { Ok(None) })
            .with_fetch_bulk(|keys, _ctx| async move { Ok(keys.into_iter().map(|k| (k, 1)).collect()) });
        assert!(loaders.has_fetch_maybe());
        assert!(loaders.has_fetch_bulk());
    }
}
