//! Error types for the quantum key-value cache substrate.

// Error variants and fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

/// Error raised anywhere in the cache substrate: a single cache's loader
/// path, the cluster coherence bus, or the key codecs the domain bundle
/// builds on top of it.
///
/// Every variant carries enough context (cache name, key, offending value)
/// to reconstruct what failed without the caller re-deriving it from logs.
#[derive(Debug, Clone, Error)]
pub enum QkvcError {
    /// `fetch` was called, the loader ran, and it reported the key does not
    /// exist. `fetchMaybe`/`fetchMany` never produce this variant — absence
    /// is a valid `None`/omitted-entry result for them.
    #[error("key not found in cache {cache}: {key}")]
    KeyNotFound { cache: String, key: String },

    /// A loader invocation raised instead of resolving. `causes` holds one
    /// message for a single failing key, or one message per failing key
    /// when a bulk fetch partially fails.
    #[error("fetch failed in cache {cache} for key {key}: {}", join_causes(.causes))]
    FetchFailed { cache: String, key: String, causes: Vec<String> },

    /// `dispose()` has been called and is still draining in-flight work;
    /// new entry points reject immediately rather than race the teardown.
    #[error("cache {cache} is disposing")]
    Disposing { cache: String },

    /// `dispose()` has completed; the cache is permanently unusable.
    #[error("cache {cache} is disposed")]
    Disposed { cache: String },

    /// The operation's cancellation token fired before the loader settled.
    #[error("operation on cache {cache} aborted for key {key}")]
    Aborted { cache: String, key: String },

    /// An emoji cache key string didn't parse as `name` or `name host`.
    #[error("invalid emoji key: {raw:?}")]
    InvalidEmojiKey { raw: String },

    /// An emoji name failed the local name-grammar check.
    #[error("invalid emoji name: {name:?}")]
    InvalidEmojiName { name: String },

    /// An emoji host failed punycode normalization.
    #[error("invalid emoji host: {host:?}")]
    InvalidEmojiHost { host: String },

    /// An emoji `(name, host)` pair was inserted twice.
    #[error("duplicate emoji {name:?} host={host:?}")]
    DuplicateEmoji { name: String, host: Option<String> },

    /// An operation that requires a local user was given a remote one.
    #[error("user {user_id} is not local")]
    UserNotLocal { user_id: String },

    /// An operation that requires a remote user was given a local one.
    #[error("user {user_id} is not remote")]
    UserNotRemote { user_id: String },

    /// An internal invariant of the active-fetch de-duplication table or
    /// the coherence bus was violated. This indicates a bug in the cache
    /// substrate itself, never caller misuse.
    #[error("quantum cache invariant violated in {cache}: {message}")]
    QuantumCacheError { cache: String, message: String },

    /// Catch-all for conditions that don't fit a more specific variant
    /// (e.g. registering two caches under the same name).
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn join_causes(causes: &[String]) -> String {
    match causes.len() {
        0 => "unknown cause".to_string(),
        1 => causes[0].clone(),
        _ => causes.join("; "),
    }
}

impl QkvcError {
    #[must_use]
    pub fn key_not_found(cache: impl Into<String>, key: impl Into<String>) -> Self {
        Self::KeyNotFound { cache: cache.into(), key: key.into() }
    }

    #[must_use]
    pub fn fetch_failed(
        cache: impl Into<String>,
        key: impl Into<String>,
        causes: Vec<String>,
    ) -> Self {
        Self::FetchFailed { cache: cache.into(), key: key.into(), causes }
    }

    #[must_use]
    pub fn disposing(cache: impl Into<String>) -> Self {
        Self::Disposing { cache: cache.into() }
    }

    #[must_use]
    pub fn disposed(cache: impl Into<String>) -> Self {
        Self::Disposed { cache: cache.into() }
    }

    #[must_use]
    pub fn aborted(cache: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Aborted { cache: cache.into(), key: key.into() }
    }

    #[must_use]
    pub fn quantum_cache_error(cache: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QuantumCacheError { cache: cache.into(), message: message.into() }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    #[must_use]
    pub fn invalid_emoji_key(raw: impl Into<String>) -> Self {
        Self::InvalidEmojiKey { raw: raw.into() }
    }

    #[must_use]
    pub fn invalid_emoji_name(name: impl Into<String>) -> Self {
        Self::InvalidEmojiName { name: name.into() }
    }

    #[must_use]
    pub fn invalid_emoji_host(host: impl Into<String>) -> Self {
        Self::InvalidEmojiHost { host: host.into() }
    }

    #[must_use]
    pub fn duplicate_emoji(name: impl Into<String>, host: Option<String>) -> Self {
        Self::DuplicateEmoji { name: name.into(), host }
    }

    #[must_use]
    pub fn user_not_local(user_id: impl Into<String>) -> Self {
        Self::UserNotLocal { user_id: user_id.into() }
    }

    #[must_use]
    pub fn user_not_remote(user_id: impl Into<String>) -> Self {
        Self::UserNotRemote { user_id: user_id.into() }
    }

    /// Stable, lower-snake-case identifier for the error kind, suitable for
    /// logging or metrics labels without pulling the full `Display` text.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::KeyNotFound { .. } => "key_not_found",
            Self::FetchFailed { .. } => "fetch_failed",
            Self::Disposing { .. } => "disposing",
            Self::Disposed { .. } => "disposed",
            Self::Aborted { .. } => "aborted",
            Self::InvalidEmojiKey { .. } => "invalid_emoji_key",
            Self::InvalidEmojiName { .. } => "invalid_emoji_name",
            Self::InvalidEmojiHost { .. } => "invalid_emoji_host",
            Self::DuplicateEmoji { .. } => "duplicate_emoji",
            Self::UserNotLocal { .. } => "user_not_local",
            Self::UserNotRemote { .. } => "user_not_remote",
            Self::QuantumCacheError { .. } => "quantum_cache_error",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether a caller could plausibly succeed by retrying the same
    /// operation unchanged. `KeyNotFound` and the validation variants never
    /// are; `FetchFailed` might be (the loader's cause is opaque to us), and
    /// `Disposing` never resolves back to usable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::Aborted { .. })
    }
}

pub type Result<T> = std::result::Result<T, QkvcError>;
