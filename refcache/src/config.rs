//! Configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `REFCACHE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `REFCACHE_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `REFCACHE_BATCHER__BATCH_SIZE=50` sets the `batcher.batch_size` field.
//!
//! ## Example
//!
//! ```yaml
//! load_ttl: 3h
//! batcher:
//!   batch_size: 100
//!   debounce: 50ms
//!   max_wait: 500ms
//! retry:
//!   max_retries: 3
//!   backoff_ms: 1000
//! resources:
//!   - resource_type: project
//!     url: https://console.example.com/identity/project/list
//!     id_field: project_id
//!     only: [project_id, name]
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// CLI args - config file plus an optional one-shot resolution
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "REFCACHE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit.
    #[arg(long)]
    pub validate: bool,

    /// Resource type to resolve IDs for (must be listed under `resources`)
    #[arg(short, long)]
    pub resource: Option<String>,

    /// IDs to resolve
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Root configuration.
///
/// All fields have defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Namespace prefix for reference maps in the shared store
    pub cache_key_base: String,
    /// Console log output format
    pub log_format: LogFormat,
    /// How long a full `load` of a resource type stays fresh
    #[serde(with = "humantime_serde")]
    pub load_ttl: Duration,
    /// Timeout for a single list call against the backend
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long the CLI waits for IDs to resolve
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,
    pub batcher: BatcherConfig,
    pub retry: RetryConfig,
    /// Resource types served by HTTP list endpoints
    pub resources: Vec<ResourceConfig>,
}

/// ID batching configuration.
///
/// At least one of `batch_size` and `debounce` must be set. `max_wait` bounds how long the
/// first ID of a batch can be held back by a continuous stream of requests, so it is only
/// accepted together with `debounce`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatcherConfig {
    /// Flush as soon as this many unique IDs are queued.
    /// Default: 100
    pub batch_size: Option<usize>,
    /// Flush after this much inactivity.
    /// Default: 50ms
    #[serde(with = "humantime_serde")]
    pub debounce: Option<Duration>,
    /// Flush no later than this long after the first ID of a batch was queued.
    /// Requires `debounce`.
    /// Default: 500ms
    #[serde(with = "humantime_serde")]
    pub max_wait: Option<Duration>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: Some(100),
            debounce: Some(Duration::from_millis(50)),
            max_wait: Some(Duration::from_millis(500)),
        }
    }
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size.is_none() && self.debounce.is_none() {
            return Err(Error::InvalidConfig {
                message: "batcher needs at least one of batch_size or debounce".to_string(),
            });
        }
        if self.batch_size == Some(0) {
            return Err(Error::InvalidConfig {
                message: "batcher.batch_size must be greater than zero".to_string(),
            });
        }
        match (self.debounce, self.max_wait) {
            (None, Some(_)) => Err(Error::InvalidConfig {
                message: "batcher.max_wait requires batcher.debounce; set max_wait to null for size-only batching".to_string(),
            }),
            (Some(debounce), Some(max_wait)) if max_wait < debounce => Err(Error::InvalidConfig {
                message: format!("batcher.max_wait ({max_wait:?}) cannot be shorter than batcher.debounce ({debounce:?})"),
            }),
            _ => Ok(()),
        }
    }
}

/// Retry behaviour for IDs whose bulk fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Consecutive failures after which an ID is no longer retried automatically.
    /// Default: 3
    pub max_retries: u32,
    /// Base backoff after the first failure, in milliseconds.
    /// Default: 1000
    pub backoff_ms: u64,
    /// Factor applied to the backoff for each further failure.
    /// Default: 2
    pub backoff_factor: u64,
    /// Maximum backoff, in milliseconds.
    /// Default: 30000
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Backoff before the next attempt after `failures` consecutive failures.
    ///
    /// `backoff_ms * backoff_factor ^ (failures - 1)`, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(failures - 1));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    /// Whether an ID that failed `failures` times in a row may be fetched again.
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_retries
    }
}

/// A resource type resolved through an HTTP list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    /// Registry key, e.g. `project`
    pub resource_type: String,
    /// Human readable name (defaults to the resource type)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// List endpoint the bulk query is POSTed to
    pub url: Url,
    /// ID field on the raw resource, also used for the `in` filter
    pub id_field: String,
    /// Field used as the item name
    #[serde(default = "ResourceConfig::default_name_field")]
    pub name_field: String,
    /// Field used as the item label (defaults to the name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_field: Option<String>,
    /// Field projection sent with every list call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
    /// Bearer token for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    /// How raw resources become reference items
    #[serde(default)]
    pub adaptor: AdaptorKind,
}

/// Adaptor used for a configured resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptorKind {
    /// Map `id_field`, `name_field`, `label_field` and `icon_field`
    #[default]
    Fields,
    /// `"<group> > <name>"` labels, groups read from the `project_group` map
    Project,
    /// `"<user_id> (<name>)"` labels
    User,
    Workspace,
}

impl ResourceConfig {
    fn default_name_field() -> String {
        "name".to_string()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.resource_type)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_key_base: "reference".to_string(),
            log_format: LogFormat::Text,
            load_ttl: Duration::from_secs(60 * 60 * 3),
            request_timeout: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(10),
            batcher: BatcherConfig::default(),
            retry: RetryConfig::default(),
            resources: Vec::new(),
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        self.batcher.validate()?;

        if self.retry.backoff_factor == 0 {
            return Err(Error::InvalidConfig {
                message: "retry.backoff_factor must be at least 1".to_string(),
            });
        }
        if self.retry.backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::InvalidConfig {
                message: format!(
                    "retry.backoff_ms ({}) cannot be greater than retry.max_backoff_ms ({})",
                    self.retry.backoff_ms, self.retry.max_backoff_ms
                ),
            });
        }

        let mut seen = HashSet::new();
        for resource in &self.resources {
            if resource.resource_type.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    message: "resources[].resource_type cannot be empty".to_string(),
                });
            }
            if resource.id_field.trim().is_empty() {
                return Err(Error::InvalidConfig {
                    message: format!("resource '{}' has an empty id_field", resource.resource_type),
                });
            }
            if !seen.insert(resource.resource_type.as_str()) {
                return Err(Error::InvalidConfig {
                    message: format!("resource '{}' is configured more than once", resource.resource_type),
                });
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables override specific values
            .merge(Env::prefixed("REFCACHE_").split("__").ignore(&["config"]))
    }

    pub fn resource(&self, resource_type: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.resource_type == resource_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn args(path: &str) -> Args {
        Args {
            config: path.to_string(),
            validate: false,
            resource: None,
            ids: Vec::new(),
        }
    }

    #[test]
    fn test_defaults_when_file_is_missing() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("missing.yaml"))?;

            assert_eq!(config.cache_key_base, "reference");
            assert_eq!(config.load_ttl, Duration::from_secs(3 * 60 * 60));
            assert_eq!(config.batcher.batch_size, Some(100));
            assert_eq!(config.batcher.debounce, Some(Duration::from_millis(50)));
            assert_eq!(config.retry.max_retries, 3);
            assert!(config.resources.is_empty());

            Ok(())
        });
    }

    #[test]
    fn test_resources_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
load_ttl: 10m
batcher:
  batch_size: 20
  debounce: 100ms
  max_wait: 1s
resources:
  - resource_type: project
    name: Project
    url: https://console.example.com/identity/project/list
    id_field: project_id
    only: [project_id, name]
  - resource_type: user
    url: https://console.example.com/identity/user/list
    id_field: user_id
    label_field: email
    adaptor: user
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.load_ttl, Duration::from_secs(600));
            assert_eq!(config.batcher.batch_size, Some(20));
            assert_eq!(config.batcher.debounce, Some(Duration::from_millis(100)));
            assert_eq!(config.batcher.max_wait, Some(Duration::from_secs(1)));
            assert_eq!(config.resources.len(), 2);

            let project = config.resource("project").unwrap();
            assert_eq!(project.display_name(), "Project");
            assert_eq!(project.id_field, "project_id");
            assert_eq!(project.name_field, "name"); // default
            assert_eq!(project.only.as_ref().unwrap().len(), 2);

            let user = config.resource("user").unwrap();
            assert_eq!(user.display_name(), "user");
            assert_eq!(user.label_field.as_deref(), Some("email"));
            assert_eq!(user.adaptor, AdaptorKind::User);
            assert_eq!(project.adaptor, AdaptorKind::Fields);

            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
batcher:
  batch_size: 20
retry:
  backoff_ms: 200
"#,
            )?;

            jail.set_env("REFCACHE_BATCHER__BATCH_SIZE", "5");
            jail.set_env("REFCACHE_LOG_FORMAT", "json");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.batcher.batch_size, Some(5));
            assert_eq!(config.log_format, LogFormat::Json);
            // YAML values are preserved
            assert_eq!(config.retry.backoff_ms, 200);

            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "batcher:\n  batchsize: 3\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_batcher_needs_a_trigger() {
        let mut config = Config::default();
        config.batcher.batch_size = None;
        config.batcher.debounce = None;

        let result = config.validate();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_batcher_rejects_zero_batch_size_and_short_max_wait() {
        let mut config = Config::default();
        config.batcher.batch_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batcher.debounce = Some(Duration::from_millis(200));
        config.batcher.max_wait = Some(Duration::from_millis(100));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_wait_requires_debounce() {
        let mut config = Config::default();
        config.batcher.debounce = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_wait requires batcher.debounce"), "{err}");

        config.batcher.max_wait = None;
        assert!(config.validate().is_ok());

        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "batcher:\n  batch_size: 10\n  debounce: null\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());

            jail.create_file("size-only.yaml", "batcher:\n  batch_size: 10\n  debounce: null\n  max_wait: null\n")?;
            let config = Config::load(&args("size-only.yaml"))?;
            assert_eq!(config.batcher.max_wait, None);
            Ok(())
        });
    }

    #[test]
    fn test_duplicate_resource_types_rejected() {
        let resource = ResourceConfig {
            resource_type: "project".to_string(),
            name: None,
            url: "http://localhost/identity/project/list".parse().unwrap(),
            id_field: "project_id".to_string(),
            name_field: "name".to_string(),
            label_field: None,
            icon_field: None,
            only: None,
            api_token: None,
            adaptor: AdaptorKind::Fields,
        };
        let config = Config {
            resources: vec![resource.clone(), resource],
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_backoff_schedule() {
        let retry = RetryConfig {
            max_retries: 5,
            backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 500,
        };

        assert_eq!(retry.backoff_for(0), Duration::ZERO);
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(4), Duration::from_millis(500)); // capped
        assert_eq!(retry.backoff_for(40), Duration::from_millis(500));

        assert!(retry.allows_retry(4));
        assert!(!retry.allows_retry(5));
    }
}
