//! Re-exports the shared error type and adds crate-local conversion helpers.

pub use qkvc_error::{QkvcError, Result};

/// Extension trait for attaching cache/key context to a foreign error while
/// converting it into a [`QkvcError`].
pub trait ErrorContext<T> {
    /// Wrap a failed loader call as `QkvcError::FetchFailed` for `cache`/`key`.
    fn fetch_context(self, cache: &str, key: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ErrorContext<T> for std::result::Result<T, E> {
    fn fetch_context(self, cache: &str, key: &str) -> Result<T> {
        self.map_err(|e| QkvcError::fetch_failed(cache, key, vec![e.to_string()]))
    }
}
