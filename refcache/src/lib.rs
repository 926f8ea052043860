//! # refcache: batched reference resolution
//!
//! `refcache` turns foreign-key-style resource IDs (project IDs, user IDs, workspace IDs, ...)
//! into display-ready [`ReferenceItem`]s without issuing one request per ID.
//!
//! ## Overview
//!
//! Screens that show lists of resources usually reference other resources by ID: a table of
//! alerts shows the project each alert belongs to, a cost report shows the workspace behind each
//! line. Resolving those IDs one by one floods the backend with tiny requests. `refcache` collects
//! the IDs that are read within a short window, fetches them in one bulk `list` call with an `in`
//! filter, and keeps the results in a shared, observable reference map.
//!
//! ## Architecture
//!
//! ```text
//! ReferenceProxy::read(id)
//!        │ miss
//!        ↓
//! ReferenceRepository ── placeholder + Requested ──→ ReferenceMap (shared store)
//!        │ request_item                                    ↑ merge, Resolved
//!        ↓                                                 │
//!    IdBatcher ── size / debounce / max_wait ──→ flush_batch ── ListFetcher::list
//! ```
//!
//! - [`batcher::IdBatcher`] deduplicates IDs and flushes them in batches. It does no I/O.
//! - [`repository::ReferenceRepository`] owns one resource type: it tracks queued, in-flight and
//!   failed IDs, runs the bulk fetch and merges adapted results.
//! - [`store::ReferenceStore`] holds one [`store::ReferenceMap`] per resource type and broadcasts
//!   [`store::ReferenceEvent`]s when they change.
//! - [`proxy::ReferenceProxy`] gives lazy read access: resolved items are returned, unknown IDs
//!   are requested.
//! - [`registry::RepositoryRegistry`] maps resource types to repositories and is the object
//!   applications pass around.
//!
//! Backends are reached through the [`fetcher::ListFetcher`] trait ([`fetcher::HttpListFetcher`]
//! in production) and raw resources are mapped by a [`adaptors::ReferenceAdaptor`].
//!
//! ## Configuration
//!
//! The `refcache` binary and [`registry::RepositoryRegistry::from_config`] read a YAML file with
//! `REFCACHE_`-prefixed environment overrides, see [`config`].

pub mod adaptors;
pub mod batcher;
pub mod config;
pub mod errors;
pub mod fetcher;
pub mod proxy;
pub mod registry;
pub mod repository;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::Config;
pub use errors::{Error, Result};
pub use proxy::ReferenceProxy;
pub use registry::{RegistryDefaults, RepositoryRegistry};
pub use repository::{ReferenceRepository, RepositorySpec};
pub use types::{LoadOptions, ReferenceId, ReferenceItem, ReferenceTypeInfo, ResourceType};
