//! # QKVC — Quantum Key-Value Cache substrate
//!
//! A cluster-coherent, in-process caching core for federated actor-graph
//! servers: de-duplicating fetch pipelines over named caches, lifetime-bounded
//! in-memory storage, and a pub/sub invalidation protocol that keeps every
//! process in the cluster eventually consistent after a known mutation.
//!
//! ## Architecture
//!
//! - **Event bus** (`bus`): topic pub/sub, local emits dispatch synchronously
//!   then publish to a [`ClusterTransport`](bus::transport::ClusterTransport)
//!   for peers; remote frames arrive back through the same bus as non-local
//!   events.
//! - **Memory store** (`store`): the per-key expiring map every cache is
//!   built on.
//! - **Quantum cache** (`cache`): the public fetch/set/delete contract, with
//!   nested concurrency limiters and active-fetch de-duplication.
//! - **Registry** (`registry`): owns every named cache, wires each one's
//!   coherence topic, and drives ordered shutdown.
//! - **Domain bundle** (`domain`): the concrete catalog of caches a federated
//!   social server needs (users, profiles, follows, emojis, instances, …) and
//!   the invalidation rules between them. `userFollowStats` lives here too,
//!   as a plain [`MemoryCache`] with no loader pipeline and no cluster
//!   coherence — every other entry in the catalog is a [`QuantumCache`].
//!
//! ## Example
//!
//! ```ignore
//! use qkvc_core::{CacheRegistry, RegistryOptions};
//! use qkvc_core::domain::DomainCacheBundle;
//!
//! # async fn example(loaders: qkvc_core::domain::DomainLoaders, refetch: qkvc_core::domain::HibernationRefetch) -> qkvc_core::Result<()> {
//! let registry = CacheRegistry::new(RegistryOptions::new("proc-a", "example.com"));
//! let bundle = DomainCacheBundle::new(&registry, loaders, refetch)?;
//! let user = bundle.user_by_id.fetch("01HXYZ".into()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_self)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::if_not_else)]
#![allow(clippy::or_fun_call)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::missing_panics_doc)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod registry;
pub mod store;

pub use cache::QuantumCache;
pub use config::{CacheOptions, RegistryOptions};
pub use error::{QkvcError, Result};
pub use registry::CacheRegistry;
pub use store::MemoryCache;

/// Version of the qkvc-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.88";
