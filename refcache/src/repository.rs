//! Per-resource-type reference repository.
//!
//! A [`ReferenceRepository`] owns the reference data of one resource type. It turns scattered
//! "I need ID x" calls into bulk list calls through an [`IdBatcher`], merges the adapted results
//! into its [`ReferenceMap`], and keeps track of where every requested ID is in its lifecycle:
//!
//! ```text
//! absent ─ensure_requested─→ placeholder + queued ─flush─→ pending ─┬─ok──→ resolved
//!                                                                  ├─ok, missing─→ placeholder
//!                                                                  └─err─→ absent + backoff
//! ```
//!
//! An ID is never part of two concurrent fetches. Failed IDs are retried with exponential
//! backoff when they are requested again, up to `retry.max_retries` consecutive failures; after
//! that only [`ReferenceRepository::refresh`] or an invalidation brings them back.
//!
//! Every invalidation bumps an epoch. Fetches dispatched under an older epoch are discarded when
//! they complete.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::adaptors::{ReferenceAdaptor, field_text};
use crate::batcher::IdBatcher;
use crate::config::{BatcherConfig, RetryConfig};
use crate::errors::{Error, Result};
use crate::fetcher::ListFetcher;
use crate::store::{ReferenceEvent, ReferenceMap};
use crate::types::{Filter, ListParams, ListQuery, LoadOptions, ReferenceId, ReferenceItem, ReferenceTypeInfo, ResourceType};

/// Receives every fetch error after the repository has recovered from it.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Error handler that logs the failure.
pub fn log_errors() -> ErrorHandler {
    Arc::new(|err: &Error| error!(error = %err, transient = err.is_transient(), "Reference fetch failed"))
}

/// Everything needed to build the repository of one resource type.
#[derive(Clone)]
pub struct RepositorySpec {
    pub resource_type: ResourceType,
    /// ID field on the raw resource, used for the `in` filter
    pub id_field: String,
    /// Human readable name of the resource type
    pub name: String,
    /// Projection and fixed filters sent with every list call
    pub query: ListQuery,
    pub fetcher: Arc<dyn ListFetcher>,
    pub adaptor: Arc<dyn ReferenceAdaptor>,
    /// Overrides the registry's batcher settings
    pub batcher: Option<BatcherConfig>,
    /// Overrides the registry's retry settings
    pub retry: Option<RetryConfig>,
    /// Resource types the adaptor reads from while mapping this one
    pub dependencies: Vec<DependencySpec>,
}

impl RepositorySpec {
    pub fn new(
        resource_type: impl Into<String>,
        id_field: impl Into<String>,
        fetcher: Arc<dyn ListFetcher>,
        adaptor: Arc<dyn ReferenceAdaptor>,
    ) -> Self {
        let resource_type = resource_type.into();
        Self {
            name: resource_type.clone(),
            resource_type,
            id_field: id_field.into(),
            query: ListQuery::default(),
            fetcher,
            adaptor,
            batcher: None,
            retry: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_query(mut self, query: ListQuery) -> Self {
        self.query = query;
        self
    }

    pub fn with_batcher(mut self, batcher: BatcherConfig) -> Self {
        self.batcher = Some(batcher);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Resolves the `resource_type` references found in `field` before this type's resources
    /// are adapted.
    pub fn with_dependency(mut self, resource_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.dependencies.push(DependencySpec {
            resource_type: resource_type.into(),
            field: field.into(),
        });
        self
    }
}

/// A resource type referenced from `field` of another type's raw resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub resource_type: ResourceType,
    pub field: String,
}

/// A dependency bound to the repository serving it.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub field: String,
    pub repository: Arc<ReferenceRepository>,
}

impl std::fmt::Debug for RepositorySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositorySpec")
            .field("resource_type", &self.resource_type)
            .field("id_field", &self.id_field)
            .field("name", &self.name)
            .field("query", &self.query)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Runtime settings of a repository, mostly handed down by its registry.
#[derive(Clone)]
pub struct RepositoryOptions {
    pub batcher: BatcherConfig,
    pub retry: RetryConfig,
    /// How long a full `load` stays fresh
    pub load_ttl: Duration,
    /// How long a batch waits for its dependencies to resolve
    pub resolve_timeout: Duration,
    pub on_error: ErrorHandler,
    /// Cancels scheduled retries; cancelled by [`ReferenceRepository::shutdown`]
    pub cancel: CancellationToken,
    pub dependencies: Vec<Dependency>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            retry: RetryConfig::default(),
            load_ttl: Duration::from_secs(60 * 60 * 3),
            resolve_timeout: Duration::from_secs(10),
            on_error: log_errors(),
            cancel: CancellationToken::new(),
            dependencies: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct RetryState {
    failures: u32,
    next_attempt: Instant,
    /// A delayed request is already waiting for `next_attempt`
    scheduled: bool,
}

#[derive(Debug, Default)]
struct RepositoryState {
    /// Handed to the batcher, not flushed yet
    queued: HashSet<ReferenceId>,
    /// Part of a dispatched fetch
    pending: HashSet<ReferenceId>,
    retries: HashMap<ReferenceId, RetryState>,
    last_loaded: Option<Instant>,
    epoch: u64,
}

/// Batched, cached access to the references of one resource type.
pub struct ReferenceRepository {
    resource_type: ResourceType,
    id_field: String,
    name: String,
    query: ListQuery,
    map: Arc<ReferenceMap>,
    fetcher: Arc<dyn ListFetcher>,
    adaptor: Arc<dyn ReferenceAdaptor>,
    batcher: IdBatcher,
    retry: RetryConfig,
    load_ttl: Duration,
    resolve_timeout: Duration,
    on_error: ErrorHandler,
    cancel: CancellationToken,
    dependencies: Vec<Dependency>,
    runtime: Handle,
    this: Arc<OnceLock<Weak<ReferenceRepository>>>,
    state: Mutex<RepositoryState>,
}

impl ReferenceRepository {
    /// Creates the repository for `spec`, storing its items in `map`.
    ///
    /// `spec.batcher` and `spec.retry` take precedence over `options`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for an empty resource type or ID field, an invalid batcher
    /// configuration, or when called outside a Tokio runtime.
    pub fn new(spec: RepositorySpec, map: Arc<ReferenceMap>, options: RepositoryOptions) -> Result<Arc<Self>> {
        if spec.resource_type.trim().is_empty() || spec.id_field.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "a repository needs a resource type and an ID field".to_string(),
            });
        }
        let runtime = Handle::try_current().map_err(|_| Error::InvalidConfig {
            message: format!("repository '{}' must be created inside a Tokio runtime", spec.resource_type),
        })?;

        let this: Arc<OnceLock<Weak<ReferenceRepository>>> = Arc::new(OnceLock::new());
        let batcher_config = spec.batcher.clone().unwrap_or(options.batcher);
        let batcher = {
            let this = this.clone();
            IdBatcher::new(&batcher_config, move |ids| {
                if let Some(repository) = this.get().and_then(Weak::upgrade) {
                    repository.dispatch(ids);
                }
            })?
            .with_label(spec.resource_type.clone())
        };

        let repository = Arc::new(Self {
            resource_type: spec.resource_type,
            id_field: spec.id_field,
            name: spec.name,
            query: spec.query,
            map,
            fetcher: spec.fetcher,
            adaptor: spec.adaptor,
            batcher,
            retry: spec.retry.unwrap_or(options.retry),
            load_ttl: options.load_ttl,
            resolve_timeout: options.resolve_timeout,
            on_error: options.on_error,
            cancel: options.cancel,
            dependencies: options.dependencies,
            runtime,
            this: this.clone(),
            state: Mutex::new(RepositoryState::default()),
        });
        let _ = this.set(Arc::downgrade(&repository));

        debug!(resource_type = %repository.resource_type, namespace = repository.map.namespace(), "Created reference repository");
        Ok(repository)
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map(&self) -> &Arc<ReferenceMap> {
        &self.map
    }

    /// The resolved item for `id`. Never triggers a fetch.
    pub fn get(&self, id: &str) -> Option<ReferenceItem> {
        self.map.get(id)
    }

    /// Makes sure `id` is being fetched if it has never been requested.
    ///
    /// Returns `true` if this call created the placeholder and issued the request.
    pub fn ensure_requested(&self, id: &str) -> bool {
        if id.is_empty() {
            debug!(resource_type = %self.resource_type, "Ignoring request for an empty ID");
            return false;
        }
        if !self.map.insert_placeholder(id) {
            return false;
        }
        self.map.emit(ReferenceEvent::Requested(id.to_string()));
        self.request_item(id);
        true
    }

    /// Queues `id` for the next bulk fetch.
    ///
    /// No-op when the ID is resolved, queued, in flight, or has exhausted its retries. An ID
    /// still backing off from a failure gets a single delayed request at its retry deadline.
    pub fn request_item(&self, id: &str) {
        if id.is_empty() || self.cancel.is_cancelled() || self.map.is_resolved(id) {
            return;
        }

        {
            let mut state = self.state.lock();
            if state.queued.contains(id) || state.pending.contains(id) {
                return;
            }

            let epoch = state.epoch;
            if let Some(retry) = state.retries.get_mut(id) {
                if !self.retry.allows_retry(retry.failures) {
                    trace!(resource_type = %self.resource_type, id, failures = retry.failures, "Retries exhausted, not requesting");
                    return;
                }
                if retry.next_attempt > Instant::now() {
                    if !retry.scheduled {
                        retry.scheduled = true;
                        self.schedule_retry(id.to_string(), retry.next_attempt, epoch);
                    }
                    return;
                }
            }

            state.queued.insert(id.to_string());
        }

        self.batcher.enqueue(id);
    }

    /// Fetches `ids` in one list call and merges the results.
    ///
    /// IDs that are already part of an in-flight fetch are skipped. The dependency references
    /// found in the response are resolved before it is adapted. Failures are recovered here:
    /// placeholders are released, backoff recorded, and the error handed to the error handler.
    #[tracing::instrument(skip(self, ids), fields(resource_type = %self.resource_type, requested = ids.len()))]
    pub async fn flush_batch(&self, ids: Vec<ReferenceId>) {
        let (batch, epoch) = {
            let mut state = self.state.lock();
            for id in &ids {
                state.queued.remove(id);
            }
            let batch: Vec<ReferenceId> = ids.into_iter().filter(|id| state.pending.insert(id.clone())).collect();
            (batch, state.epoch)
        };
        if batch.is_empty() {
            return;
        }

        let params = ListParams {
            query: self.query.with_filter(Filter::any_of(&self.id_field, &batch)),
        };
        let started = Instant::now();
        let result = self.fetcher.list(&params).await;
        histogram!("refcache_fetch_duration_seconds", "resource_type" => self.resource_type.clone())
            .record(started.elapsed().as_secs_f64());

        let result = match result {
            Ok(response) => {
                self.resolve_dependencies(&response.results).await;
                Ok(self.adapt_all(&response.results))
            }
            Err(e) => Err(e),
        };

        // Epoch check and the writes it guards share one lock; a flush lands wholly before or after
        let outcome = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                None
            } else {
                match result {
                    Ok(items) => {
                        for id in &batch {
                            state.pending.remove(id);
                            state.retries.remove(id);
                        }
                        Some(Ok(self.map.merge(items)))
                    }
                    Err(e) => {
                        let now = Instant::now();
                        for id in &batch {
                            state.pending.remove(id);
                            let retry = state.retries.entry(id.clone()).or_insert(RetryState {
                                failures: 0,
                                next_attempt: now,
                                scheduled: false,
                            });
                            retry.failures = retry.failures.saturating_add(1);
                            retry.next_attempt = now + self.retry.backoff_for(retry.failures);
                        }
                        let released = self.map.release_placeholders(&batch);
                        Some(Err((e, released)))
                    }
                }
            }
        };

        match outcome {
            None => {
                debug!(batch_size = batch.len(), "Discarding response fetched before invalidation");
            }
            Some(Ok(resolved)) => {
                debug!(
                    batch_size = batch.len(),
                    resolved = resolved.len(),
                    missing = batch.len().saturating_sub(resolved.len()),
                    "Merged reference batch"
                );
                if !resolved.is_empty() {
                    self.map.emit(ReferenceEvent::Resolved(resolved));
                }
            }
            Some(Err((e, released))) => {
                let err = Error::fetch(&self.resource_type, e);
                counter!("refcache_fetch_errors_total", "resource_type" => self.resource_type.clone()).increment(1);
                warn!(batch_size = batch.len(), released, error = %err, "Reference batch failed");
                (self.on_error)(&err);
                self.map.emit(ReferenceEvent::Failed(batch.clone()));
            }
        }

        self.map.emit(ReferenceEvent::Settled(batch));
    }

    /// Loads every resource of this type, replacing the resolved items.
    ///
    /// Skipped while the last load is younger than the load TTL, or when `lazy_load` is set
    /// and items are already present, unless `force` is set. Direct dependencies are loaded
    /// first; a failed dependency load is logged and only costs label detail.
    pub async fn load(&self, options: LoadOptions) -> Result<()> {
        let epoch = {
            let state = self.state.lock();
            let fresh = state.last_loaded.is_some_and(|at| at.elapsed() < self.load_ttl);
            let lazy_hit = options.lazy_load && self.map.resolved_len() > 0;
            if (fresh || lazy_hit) && !options.force {
                trace!(resource_type = %self.resource_type, fresh, lazy_hit, "Skipping reference load");
                return Ok(());
            }
            state.epoch
        };

        for dependency in &self.dependencies {
            let repository = &dependency.repository;
            let dependency_epoch = repository.state.lock().epoch;
            if let Err(e) = repository.load_all(dependency_epoch).await {
                warn!(
                    resource_type = %self.resource_type,
                    dependency = %repository.resource_type,
                    error = %e,
                    "Dependency load failed, labels may be incomplete"
                );
            }
        }

        self.load_all(epoch).await
    }

    /// Fetches every resource and replaces the map, unless invalidated since `epoch`.
    async fn load_all(&self, epoch: u64) -> Result<()> {
        let params = ListParams { query: self.query.clone() };
        let started = Instant::now();
        let response = self.fetcher.list(&params).await.map_err(|e| {
            counter!("refcache_fetch_errors_total", "resource_type" => self.resource_type.clone()).increment(1);
            Error::fetch(&self.resource_type, e)
        })?;
        histogram!("refcache_fetch_duration_seconds", "resource_type" => self.resource_type.clone())
            .record(started.elapsed().as_secs_f64());

        let items = self.adapt_all(&response.results);
        let resolved = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                debug!(resource_type = %self.resource_type, "Discarding load fetched before invalidation");
                return Ok(());
            }
            let resolved = self.map.replace_all(items);
            for id in &resolved {
                state.retries.remove(id);
            }
            state.last_loaded = Some(Instant::now());
            resolved
        };

        debug!(resource_type = %self.resource_type, items = resolved.len(), total = ?response.total_count, "Loaded references");
        self.map.emit(ReferenceEvent::Resolved(resolved));
        Ok(())
    }

    /// Adapts and stores a single resource, e.g. right after it was created or renamed.
    pub fn sync(&self, raw: &Value) -> Result<ReferenceItem> {
        let item = self.adaptor.adapt(raw)?;
        let key = self.map.upsert(item.clone());
        self.state.lock().retries.remove(&key);
        self.map.emit(ReferenceEvent::Resolved(vec![key]));
        Ok(item)
    }

    /// Drops every item, placeholder, queued ID and retry record.
    ///
    /// Responses of fetches still in flight are discarded when they arrive.
    pub fn flush(&self) {
        let dropped = self.batcher.clear();
        {
            let mut state = self.state.lock();
            state.epoch = state.epoch.wrapping_add(1);
            state.queued.clear();
            state.pending.clear();
            state.retries.clear();
            state.last_loaded = None;
            self.map.clear();
        }
        self.map.emit(ReferenceEvent::Invalidated);
        debug!(resource_type = %self.resource_type, dropped, "Flushed reference repository");
    }

    /// Fetches `ids` again, even if resolved or out of retries.
    ///
    /// Resolved items stay readable until the new response replaces them. Returns the number
    /// of IDs queued.
    pub fn refresh(&self, ids: &[ReferenceId]) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }

        let mut queued = Vec::new();
        {
            let mut state = self.state.lock();
            for id in ids.iter().filter(|id| !id.is_empty()) {
                state.retries.remove(id);
                if state.pending.contains(id) || !state.queued.insert(id.clone()) {
                    continue;
                }
                queued.push(id.clone());
            }
        }

        for id in &queued {
            if self.map.insert_placeholder(id) {
                self.map.emit(ReferenceEvent::Requested(id.clone()));
            }
            self.batcher.enqueue(id.as_str());
        }
        queued.len()
    }

    /// Requests `ids` and waits until each is resolved or its fetch has settled.
    ///
    /// IDs the backend doesn't know, or whose fetch failed for good, map to `None`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidId`] for an empty ID and [`Error::Timeout`] if some IDs are
    /// still outstanding after `timeout`.
    pub async fn resolve(&self, ids: &[ReferenceId], timeout: Duration) -> Result<HashMap<ReferenceId, Option<ReferenceItem>>> {
        if ids.iter().any(|id| id.is_empty()) {
            return Err(Error::InvalidId {
                resource_type: self.resource_type.clone(),
                reason: "IDs cannot be empty".to_string(),
            });
        }

        // Subscribe first so no settlement can slip between requesting and waiting
        let mut events = self.map.subscribe();
        for id in ids {
            if !self.ensure_requested(id) {
                self.request_item(id);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let outstanding = self.outstanding(ids);
            if outstanding == 0 {
                break;
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    return Err(Error::Timeout {
                        waited: timeout,
                        pending: outstanding,
                    });
                }
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => break,
            }
        }

        Ok(ids.iter().map(|id| (id.clone(), self.map.get(id))).collect())
    }

    /// Snapshot of this resource type and its resolved items.
    pub fn type_info(&self) -> ReferenceTypeInfo {
        ReferenceTypeInfo {
            resource_type: self.resource_type.clone(),
            key: self.id_field.clone(),
            name: self.name.clone(),
            reference_map: self.map.resolved(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReferenceEvent> {
        self.map.subscribe()
    }

    /// Stops scheduling work: queued IDs are dropped and delayed retries cancelled.
    ///
    /// Fetches already in flight complete normally.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.batcher.clear();
        self.state.lock().queued.clear();
    }

    /// Number of IDs in a dispatched, not yet settled fetch.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of IDs waiting in the batcher.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Consecutive failed fetches of `id`.
    pub fn failures(&self, id: &str) -> u32 {
        self.state.lock().retries.get(id).map_or(0, |retry| retry.failures)
    }

    fn outstanding(&self, ids: &[ReferenceId]) -> usize {
        let state = self.state.lock();
        ids.iter()
            .filter(|id| !self.map.is_resolved(id))
            .filter(|id| {
                state.queued.contains(*id)
                    || state.pending.contains(*id)
                    || state.retries.get(*id).is_some_and(|retry| retry.scheduled)
            })
            .count()
    }

    /// Resolves the dependency IDs `raw` refers to so the adaptor can read them.
    ///
    /// A dependency that fails or times out only costs label detail.
    async fn resolve_dependencies(&self, raw: &[Value]) {
        for dependency in &self.dependencies {
            let ids: HashSet<ReferenceId> = raw
                .iter()
                .filter_map(|resource| field_text(resource, &dependency.field))
                .filter(|id| !id.is_empty() && !dependency.repository.map().is_resolved(id))
                .collect();
            if ids.is_empty() {
                continue;
            }
            let ids: Vec<ReferenceId> = ids.into_iter().collect();
            if let Err(e) = dependency.repository.resolve(&ids, self.resolve_timeout).await {
                warn!(
                    resource_type = %self.resource_type,
                    dependency = %dependency.repository.resource_type,
                    error = %e,
                    "Dependency references unresolved"
                );
            }
        }
    }

    fn adapt_all(&self, raw: &[Value]) -> Vec<ReferenceItem> {
        raw.iter()
            .filter_map(|resource| match self.adaptor.adapt(resource) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(resource_type = %self.resource_type, error = %e, "Skipping malformed resource");
                    None
                }
            })
            .collect()
    }

    /// Batcher callback: runs the fetch on the runtime.
    fn dispatch(self: Arc<Self>, ids: Vec<ReferenceId>) {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            self.flush_batch(ids).await;
        });
    }

    fn schedule_retry(&self, id: ReferenceId, at: Instant, epoch: u64) {
        let Some(this) = self.this.get().cloned() else {
            return;
        };
        let cancel = self.cancel.clone();
        trace!(resource_type = %self.resource_type, id = %id, "Scheduling delayed retry");

        self.runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(at) => {}
            }
            let Some(repository) = this.upgrade() else {
                return;
            };
            {
                let mut state = repository.state.lock();
                if state.epoch != epoch {
                    return;
                }
                if let Some(retry) = state.retries.get_mut(&id) {
                    retry.scheduled = false;
                }
            }
            // Only retry IDs someone is still waiting for
            if repository.map.contains(&id) {
                repository.request_item(&id);
            }
        });
    }
}

impl std::fmt::Debug for ReferenceRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceRepository")
            .field("resource_type", &self.resource_type)
            .field("id_field", &self.id_field)
            .field("namespace", &self.map.namespace())
            .field("items", &self.map.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptors::FieldAdaptor;
    use crate::fetcher::MockListFetcher;
    use crate::types::ListResponse;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DEBOUNCE: Duration = Duration::from_millis(50);

    fn projects() -> Vec<Value> {
        vec![
            json!({"project_id": "p-1", "name": "Alpha"}),
            json!({"project_id": "p-2", "name": "Beta"}),
            json!({"project_id": "p-3", "name": "Gamma"}),
        ]
    }

    fn options() -> RepositoryOptions {
        RepositoryOptions {
            batcher: BatcherConfig {
                batch_size: Some(100),
                debounce: Some(DEBOUNCE),
                max_wait: None,
            },
            retry: RetryConfig {
                max_retries: 3,
                backoff_ms: 100,
                backoff_factor: 2,
                max_backoff_ms: 1000,
            },
            load_ttl: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn repository(mock: &MockListFetcher, options: RepositoryOptions) -> Arc<ReferenceRepository> {
        let spec = RepositorySpec::new(
            "project",
            "project_id",
            Arc::new(mock.clone()),
            Arc::new(FieldAdaptor::new("project", "project_id", "name")),
        )
        .with_name("Project")
        .with_query(ListQuery {
            filter: Vec::new(),
            only: Some(vec!["project_id".to_string(), "name".to_string()]),
        });
        ReferenceRepository::new(spec, Arc::new(ReferenceMap::new("reference/project")), options).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scattered_reads_become_one_bulk_call() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());

        assert!(repo.ensure_requested("p-1"));
        assert!(repo.ensure_requested("p-2"));
        assert!(!repo.ensure_requested("p-1"));
        assert_eq!(repo.queued_len(), 2);
        assert_eq!(mock.call_count(), 0);

        advance(DEBOUNCE).await;

        assert_eq!(mock.call_count(), 1);
        assert_eq!(
            mock.requested_ids(0, "project_id"),
            Some(vec!["p-1".to_string(), "p-2".to_string()])
        );
        // The static projection is sent along
        assert_eq!(mock.get_calls()[0].query.only.as_ref().unwrap().len(), 2);
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
        assert_eq!(repo.get("p-2").unwrap().label, "Beta");
        assert_eq!(repo.queued_len(), 0);
        assert_eq!(repo.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_fetch_in_flight_per_id() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let trigger = mock.add_response_with_trigger(Ok(ListResponse {
            results: vec![json!({"project_id": "p-1", "name": "Alpha"})],
            total_count: Some(1),
        }));
        let repo = repository(&mock, options());

        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 1);
        assert_eq!(repo.pending_len(), 1);

        // Requests while the fetch is outstanding are no-ops
        assert!(!repo.ensure_requested("p-1"));
        repo.request_item("p-1");
        repo.request_item("p-1");
        assert_eq!(repo.queued_len(), 0);
        advance(DEBOUNCE * 4).await;
        assert_eq!(mock.call_count(), 1);

        // A batch containing an in-flight ID only fetches the others
        repo.flush_batch(vec!["p-1".to_string(), "p-2".to_string()]).await;
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requested_ids(1, "project_id"), Some(vec!["p-2".to_string()]));

        trigger.send(()).unwrap();
        settle().await;
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
        assert_eq!(repo.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_ids_stay_unresolved() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());
        let mut events = repo.subscribe();

        for id in ["p-1", "p-3", "p-404"] {
            repo.ensure_requested(id);
        }
        advance(DEBOUNCE).await;

        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
        assert_eq!(repo.get("p-3").unwrap().name, "Gamma");
        assert_eq!(repo.get("p-404"), None);
        assert!(repo.map().contains("p-404"), "absent IDs keep their placeholder");
        assert!(repo.get("p-2").is_none(), "unrequested IDs are not fetched");

        // No new fetch for an ID that is known to be missing
        assert!(!repo.ensure_requested("p-404"));
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ReferenceEvent::Requested("p-404".to_string())));
        assert!(seen.contains(&ReferenceEvent::Resolved(vec!["p-1".to_string(), "p-3".to_string()])));
        assert!(seen.contains(&ReferenceEvent::Settled(vec![
            "p-1".to_string(),
            "p-3".to_string(),
            "p-404".to_string()
        ])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_resources_are_skipped() {
        let mock = MockListFetcher::new();
        mock.add_response(Ok(ListResponse {
            results: vec![json!({"project_id": "p-1", "name": "Alpha"}), json!({"name": "orphan"})],
            total_count: Some(2),
        }));
        let repo = repository(&mock, options());

        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;

        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
        assert_eq!(repo.map().resolved_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[test_log::test]
    async fn test_failure_releases_and_backs_off() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        for _ in 0..3 {
            mock.add_response(Err(Error::Status {
                status: 503,
                body: "unavailable".to_string(),
            }));
        }
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let repo = repository(
            &mock,
            RepositoryOptions {
                on_error: Arc::new(move |err: &Error| {
                    assert!(matches!(err, Error::Fetch { .. }));
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                ..options()
            },
        );
        let mut events = repo.subscribe();

        // t=0 request, t=50 first failure
        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!repo.map().contains("p-1"), "placeholder released after failure");
        assert_eq!(repo.pending_len(), 0);
        assert_eq!(repo.failures("p-1"), 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ReferenceEvent::Failed(vec!["p-1".to_string()])));
        assert!(seen.contains(&ReferenceEvent::Settled(vec!["p-1".to_string()])));

        // A later read starts a new cycle once the 100ms backoff has passed
        assert!(repo.ensure_requested("p-1"));
        advance(Duration::from_millis(99)).await;
        assert_eq!(mock.call_count(), 1);
        advance(Duration::from_millis(1)).await;
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 2);
        assert_eq!(repo.failures("p-1"), 2);

        // Second backoff doubles to 200ms
        assert!(repo.ensure_requested("p-1"));
        advance(Duration::from_millis(199)).await;
        assert_eq!(mock.call_count(), 2);
        advance(Duration::from_millis(1)).await;
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 3);
        assert_eq!(repo.failures("p-1"), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 3);

        // Out of retries: reads no longer fetch
        assert!(repo.ensure_requested("p-1"));
        advance(Duration::from_secs(10)).await;
        assert_eq!(mock.call_count(), 3);

        // An explicit refresh starts over
        assert_eq!(repo.refresh(&["p-1".to_string()]), 1);
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 4);
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
        assert_eq!(repo.failures("p-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_refetches_resolved_ids() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());

        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");

        mock.set_records(vec![json!({"project_id": "p-1", "name": "Alpha (renamed)"})]);
        assert_eq!(repo.refresh(&["p-1".to_string(), String::new()]), 1);
        // Still readable while the refresh is queued
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");

        advance(DEBOUNCE).await;
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha (renamed)");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_honours_ttl_force_and_lazy() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());

        repo.load(LoadOptions::default()).await.unwrap();
        assert_eq!(mock.call_count(), 1);
        assert_eq!(repo.map().resolved_len(), 3);
        // Full loads carry no ID filter
        assert_eq!(mock.requested_ids(0, "project_id"), None);

        // Fresh within the TTL
        repo.load(LoadOptions::default()).await.unwrap();
        assert_eq!(mock.call_count(), 1);

        repo.load(LoadOptions {
            force: true,
            lazy_load: false,
        })
        .await
        .unwrap();
        assert_eq!(mock.call_count(), 2);

        tokio::time::advance(Duration::from_secs(3600)).await;
        repo.load(LoadOptions::default()).await.unwrap();
        assert_eq!(mock.call_count(), 3);

        // Lazy loads skip whenever data is present, even after the TTL
        tokio::time::advance(Duration::from_secs(7200)).await;
        repo.load(LoadOptions {
            force: false,
            lazy_load: true,
        })
        .await
        .unwrap();
        assert_eq!(mock.call_count(), 3);

        repo.flush();
        assert_eq!(repo.map().resolved_len(), 0);
        repo.load(LoadOptions {
            force: false,
            lazy_load: true,
        })
        .await
        .unwrap();
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_is_returned() {
        let mock = MockListFetcher::new();
        mock.add_response(Err(Error::Status {
            status: 500,
            body: String::new(),
        }));
        let repo = repository(&mock, options());

        let err = repo.load(LoadOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_upserts_single_resource() {
        let mock = MockListFetcher::new();
        let repo = repository(&mock, options());

        let item = repo.sync(&json!({"project_id": "p-9", "name": "New project"})).unwrap();
        assert_eq!(item.key, "p-9");
        assert_eq!(repo.get("p-9").unwrap().name, "New project");

        repo.sync(&json!({"project_id": "p-9", "name": "Renamed"})).unwrap();
        assert_eq!(repo.get("p-9").unwrap().name, "Renamed");

        assert!(repo.sync(&json!({"name": "no id"})).is_err());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_discards_in_flight_response() {
        let mock = MockListFetcher::new();
        let trigger = mock.add_response_with_trigger(Ok(ListResponse {
            results: vec![json!({"project_id": "p-1", "name": "Stale"})],
            total_count: Some(1),
        }));
        let repo = repository(&mock, options());

        repo.ensure_requested("p-1");
        repo.ensure_requested("p-2");
        advance(DEBOUNCE).await;
        assert_eq!(repo.pending_len(), 2);

        repo.flush();
        assert!(repo.map().is_empty());
        assert_eq!(repo.pending_len(), 0);

        trigger.send(()).unwrap();
        settle().await;
        assert!(repo.get("p-1").is_none(), "stale response must not repopulate the map");
        assert!(repo.map().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_while_adapting_discards_response() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let target: Arc<OnceLock<Weak<ReferenceRepository>>> = Arc::new(OnceLock::new());
        let adaptor = {
            let target = target.clone();
            let fields = FieldAdaptor::new("project", "project_id", "name");
            move |raw: &Value| {
                // The response has arrived but is not merged yet
                if let Some(repository) = target.get().and_then(Weak::upgrade) {
                    repository.flush();
                }
                fields.adapt(raw)
            }
        };
        let spec = RepositorySpec::new("project", "project_id", Arc::new(mock.clone()), Arc::new(adaptor));
        let repo = ReferenceRepository::new(spec, Arc::new(ReferenceMap::new("reference/project")), options()).unwrap();
        target.set(Arc::downgrade(&repo)).unwrap();
        let mut events = repo.subscribe();

        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;

        assert_eq!(mock.call_count(), 1);
        assert!(repo.get("p-1").is_none(), "response from before the flush must not be merged");
        assert!(repo.map().is_empty());
        assert_eq!(repo.pending_len(), 0);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&ReferenceEvent::Invalidated));
        assert!(!seen.iter().any(|event| matches!(event, ReferenceEvent::Resolved(_))));
        assert_eq!(seen.last(), Some(&ReferenceEvent::Settled(vec!["p-1".to_string()])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_leaves_new_requests_alone() {
        let mock = MockListFetcher::new();
        let stale = mock.add_response_with_trigger(Err(Error::Status {
            status: 503,
            body: "unavailable".to_string(),
        }));
        let repo = repository(&mock, options());

        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;
        repo.flush();

        let fresh = mock.add_response_with_trigger(Ok(ListResponse {
            results: vec![json!({"project_id": "p-1", "name": "Alpha"})],
            total_count: Some(1),
        }));
        assert!(repo.ensure_requested("p-1"));
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 2);
        assert_eq!(repo.pending_len(), 1);

        stale.send(()).unwrap();
        settle().await;
        assert_eq!(repo.pending_len(), 1, "the new fetch is still in flight");
        assert_eq!(repo.failures("p-1"), 0);
        assert!(repo.map().contains("p-1"), "the new placeholder is kept");

        fresh.send(()).unwrap();
        settle().await;
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
        assert_eq!(repo.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_waits_for_settlement() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());

        let ids = vec!["p-2".to_string(), "p-404".to_string()];
        let resolved = repo.resolve(&ids, Duration::from_secs(5)).await.unwrap();

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["p-2"].as_ref().unwrap().name, "Beta");
        assert_eq!(resolved["p-404"], None);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_errors() {
        let mock = MockListFetcher::new();
        let _trigger = mock.add_response_with_trigger(Ok(ListResponse::default()));
        let repo = repository(&mock, options());

        let err = repo.resolve(&[String::new()], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidId { .. }));

        // The fetch never completes while the trigger is held
        let err = repo.resolve(&["p-1".to_string()], Duration::from_secs(1)).await.unwrap_err();
        match err {
            Error::Timeout { pending, .. } => assert_eq!(pending, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_info_snapshot() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());
        repo.load(LoadOptions::default()).await.unwrap();

        let info = repo.type_info();
        assert_eq!(info.resource_type, "project");
        assert_eq!(info.key, "project_id");
        assert_eq!(info.name, "Project");
        assert_eq!(info.reference_map.len(), 3);

        let serialized = serde_json::to_value(&info).unwrap();
        assert_eq!(serialized["type"], "project");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_new_requests() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = repository(&mock, options());

        repo.ensure_requested("p-1");
        repo.shutdown();
        assert_eq!(repo.queued_len(), 0);

        repo.request_item("p-2");
        advance(DEBOUNCE * 2).await;
        assert_eq!(mock.call_count(), 0);
    }

    /// Fails the first fetch of p-1 and requests it again, leaving a retry scheduled at t=150.
    async fn failed_with_retry_scheduled(mock: &MockListFetcher) -> Arc<ReferenceRepository> {
        mock.add_response(Err(Error::Status {
            status: 503,
            body: "unavailable".to_string(),
        }));
        let repo = repository(mock, options());

        repo.ensure_requested("p-1");
        advance(DEBOUNCE).await;
        assert_eq!(repo.failures("p-1"), 1);

        assert!(repo.ensure_requested("p-1"));
        assert_eq!(repo.queued_len(), 0, "backing off, not queued");
        repo
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_scheduled_retry() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = failed_with_retry_scheduled(&mock).await;

        repo.shutdown();
        advance(Duration::from_millis(200)).await;
        advance(DEBOUNCE).await;

        assert_eq!(mock.call_count(), 1);
        assert_eq!(repo.queued_len(), 0);
        assert!(repo.get("p-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drops_scheduled_retry() {
        let mock = MockListFetcher::with_dataset("project_id", projects());
        let repo = failed_with_retry_scheduled(&mock).await;

        repo.flush();
        assert_eq!(repo.failures("p-1"), 0);
        advance(Duration::from_millis(200)).await;
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 1, "the old retry never fires");
        assert_eq!(repo.queued_len(), 0);

        // A new request starts without the old backoff
        assert!(repo.ensure_requested("p-1"));
        advance(DEBOUNCE).await;
        assert_eq!(mock.call_count(), 2);
        assert_eq!(repo.get("p-1").unwrap().name, "Alpha");
    }

    #[tokio::test]
    async fn test_rejects_missing_id_field() {
        let spec = RepositorySpec::new(
            "project",
            "",
            Arc::new(MockListFetcher::new()),
            Arc::new(FieldAdaptor::new("project", "project_id", "name")),
        );
        let result = ReferenceRepository::new(spec, Arc::new(ReferenceMap::new("reference/project")), RepositoryOptions::default());
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
