//! Registry of reference repositories, one per resource type.
//!
//! The registry is an explicit context object: build it once (usually with
//! [`RepositoryRegistry::from_config`]) and pass it to whoever needs references. Repositories are
//! created on first use and live until the registry is dropped.
//!
//! ```ignore
//! let registry = RepositoryRegistry::from_config(&config)?;
//! let projects = registry.proxy("project")?;
//! let label = projects.read_label("project-1a2b3c");
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adaptors::{self, PROJECT_GROUP_FIELD};
use crate::config::{AdaptorKind, BatcherConfig, Config, RetryConfig};
use crate::errors::{Error, Result};
use crate::fetcher::HttpListFetcher;
use crate::proxy::ReferenceProxy;
use crate::repository::{Dependency, ErrorHandler, ReferenceRepository, RepositoryOptions, RepositorySpec, log_errors};
use crate::store::ReferenceStore;
use crate::types::{ListQuery, ResourceType};

/// Settings applied to every repository unless its spec overrides them.
#[derive(Clone)]
pub struct RegistryDefaults {
    /// Namespace prefix of the reference maps
    pub cache_key_base: String,
    pub batcher: BatcherConfig,
    pub retry: RetryConfig,
    pub load_ttl: Duration,
    /// How long a batch waits for the references it depends on
    pub resolve_timeout: Duration,
    pub on_error: ErrorHandler,
}

impl Default for RegistryDefaults {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl RegistryDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_key_base: config.cache_key_base.clone(),
            batcher: config.batcher.clone(),
            retry: config.retry,
            load_ttl: config.load_ttl,
            resolve_timeout: config.resolve_timeout,
            on_error: log_errors(),
        }
    }
}

pub struct RepositoryRegistry {
    store: Arc<ReferenceStore>,
    defaults: RegistryDefaults,
    repositories: DashMap<ResourceType, Arc<ReferenceRepository>>,
    /// Registered but not created yet
    specs: DashMap<ResourceType, RepositorySpec>,
    cancel: CancellationToken,
}

impl RepositoryRegistry {
    pub fn new(store: Arc<ReferenceStore>, defaults: RegistryDefaults) -> Self {
        Self {
            store,
            defaults,
            repositories: DashMap::new(),
            specs: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Builds a registry with an HTTP-backed repository registered for every configured resource.
    ///
    /// All fetchers share one HTTP connection pool. Projects depend on `project_group` when that
    /// resource is configured, so their labels carry the group name.
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new(Arc::new(ReferenceStore::new()), RegistryDefaults::from_config(config));
        let client = reqwest::Client::new();

        for resource in &config.resources {
            let fetcher = HttpListFetcher::with_client(
                client.clone(),
                resource.url.clone(),
                resource.api_token.clone(),
                config.request_timeout,
            );
            let adaptor = adaptors::for_resource(resource, |resource_type| {
                registry
                    .store
                    .map(&ReferenceStore::namespace(&registry.defaults.cache_key_base, resource_type))
            });
            let mut spec = RepositorySpec::new(&resource.resource_type, &resource.id_field, Arc::new(fetcher), adaptor)
                .with_name(resource.display_name())
                .with_query(ListQuery {
                    filter: Vec::new(),
                    only: resource.only.clone(),
                });
            if resource.adaptor == AdaptorKind::Project && config.resource("project_group").is_some() {
                spec = spec.with_dependency("project_group", PROJECT_GROUP_FIELD);
            }
            registry.register(spec)?;
        }

        info!(resources = config.resources.len(), "Reference registry configured");
        Ok(registry)
    }

    pub fn store(&self) -> &Arc<ReferenceStore> {
        &self.store
    }

    /// The repository for `spec.resource_type`, created from `spec` if it doesn't exist yet.
    ///
    /// Later calls with a different spec for the same resource type get the existing repository.
    /// The repositories of `spec.dependencies` are created first.
    ///
    /// # Errors
    /// Returns [`Error::UnknownResourceType`] for an unregistered dependency and
    /// [`Error::InvalidConfig`] for a dependency cycle.
    pub fn get_repository(&self, spec: RepositorySpec) -> Result<Arc<ReferenceRepository>> {
        self.create(spec, &mut Vec::new())
    }

    /// `chain` holds the resource types whose dependencies are being created.
    fn create(&self, spec: RepositorySpec, chain: &mut Vec<ResourceType>) -> Result<Arc<ReferenceRepository>> {
        if let Some(repository) = self.repositories.get(&spec.resource_type) {
            return Ok(repository.clone());
        }
        if chain.contains(&spec.resource_type) {
            return Err(Error::InvalidConfig {
                message: format!("dependency cycle: {} -> {}", chain.join(" -> "), spec.resource_type),
            });
        }

        // Resolved before taking the entry, which locks a shard of the map
        chain.push(spec.resource_type.clone());
        let mut dependencies = Vec::with_capacity(spec.dependencies.len());
        for dependency in &spec.dependencies {
            dependencies.push(Dependency {
                field: dependency.field.clone(),
                repository: self.find(&dependency.resource_type, chain)?,
            });
        }
        chain.pop();

        match self.repositories.entry(spec.resource_type.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let namespace = ReferenceStore::namespace(&self.defaults.cache_key_base, &spec.resource_type);
                let options = RepositoryOptions {
                    batcher: self.defaults.batcher.clone(),
                    retry: self.defaults.retry,
                    load_ttl: self.defaults.load_ttl,
                    resolve_timeout: self.defaults.resolve_timeout,
                    on_error: self.defaults.on_error.clone(),
                    cancel: self.cancel.child_token(),
                    dependencies,
                };
                let repository = ReferenceRepository::new(spec, self.store.map(&namespace), options)?;
                debug!(resource_type = %repository.resource_type(), namespace = %namespace, "Registered reference repository");
                Ok(entry.insert(repository).clone())
            }
        }
    }

    /// Registers `spec` for lazy creation on the first [`get`](Self::get).
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the resource type is already registered.
    pub fn register(&self, spec: RepositorySpec) -> Result<()> {
        if self.repositories.contains_key(&spec.resource_type) {
            return Err(Error::InvalidConfig {
                message: format!("resource type '{}' is already registered", spec.resource_type),
            });
        }
        match self.specs.entry(spec.resource_type.clone()) {
            Entry::Occupied(_) => Err(Error::InvalidConfig {
                message: format!("resource type '{}' is already registered", spec.resource_type),
            }),
            Entry::Vacant(entry) => {
                entry.insert(spec);
                Ok(())
            }
        }
    }

    /// The repository of a registered or already created resource type.
    ///
    /// # Errors
    /// Returns [`Error::UnknownResourceType`] if nobody registered `resource_type`.
    pub fn get(&self, resource_type: &str) -> Result<Arc<ReferenceRepository>> {
        self.find(resource_type, &mut Vec::new())
    }

    fn find(&self, resource_type: &str, chain: &mut Vec<ResourceType>) -> Result<Arc<ReferenceRepository>> {
        if let Some(repository) = self.repositories.get(resource_type) {
            return Ok(repository.clone());
        }
        let spec = self
            .specs
            .get(resource_type)
            .map(|spec| spec.clone())
            .ok_or_else(|| Error::UnknownResourceType {
                resource_type: resource_type.to_string(),
            })?;
        self.create(spec, chain)
    }

    /// A lazy-reading proxy over the repository of `resource_type`.
    pub fn proxy(&self, resource_type: &str) -> Result<ReferenceProxy> {
        self.get(resource_type).map(ReferenceProxy::new)
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.repositories.contains_key(resource_type) || self.specs.contains_key(resource_type)
    }

    /// Every known resource type, sorted.
    pub fn resource_types(&self) -> Vec<ResourceType> {
        let mut types: Vec<ResourceType> = self
            .repositories
            .iter()
            .map(|entry| entry.key().clone())
            .chain(self.specs.iter().map(|entry| entry.key().clone()))
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Flushes every repository. Responses still in flight are discarded.
    pub fn invalidate_all(&self) {
        for entry in self.repositories.iter() {
            entry.value().flush();
        }
        info!(repositories = self.repositories.len(), "Invalidated all reference repositories");
    }

    /// Cancels queued IDs and scheduled retries of every repository.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.repositories.iter() {
            entry.value().shutdown();
        }
        info!("Reference registry shut down");
    }
}

impl std::fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRegistry")
            .field("cache_key_base", &self.defaults.cache_key_base)
            .field("resource_types", &self.resource_types())
            .finish_non_exhaustive()
    }
}
