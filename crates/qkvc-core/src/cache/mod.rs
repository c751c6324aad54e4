//! Quantum KV Cache (component C): wraps the memory store, integrates with
//! the event bus for cluster coherence, and de-duplicates/rate-limits
//! loader calls. This is the dominant module of the crate — everything else
//! either builds on [`QuantumCache`] or configures it.
//!
//! # Module organization
//!
//! - **`quantum`**: the `QuantumCache<V>` type itself — public contract
//!   (§4.3.1), fetch de-duplication (§4.3.2), concurrency control (§4.3.3),
//!   coherence protocol (§4.3.4), and disposal.
//! - **`loader`**: the pluggable `fetch`/`fetchMaybe`/`fetchBulk` closures a
//!   cache is constructed with (§6.2), plus the loader context object
//!   (§6.3).

mod loader;
mod quantum;

pub use loader::{LoaderContext, LoaderSet};
pub use quantum::QuantumCache;
