//! Common type definitions shared by the batcher, repositories and fetchers.
//!
//! # ID Types
//!
//! Backend IDs are opaque strings (`project-1a2b3c`, `user@example.com`, ...) wrapped in type
//! aliases for readability:
//!
//! - [`ReferenceId`]: the ID of a single backend resource
//! - [`ResourceType`]: the category of resource (`project`, `user`, ...)
//!
//! # Wire types
//!
//! [`ListParams`], [`ListQuery`], [`Filter`] and [`ListResponse`] mirror the list verb of the
//! backend REST API: every bulk call is a `list` with a query carrying filters and an optional
//! field projection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ReferenceId = String;
pub type ResourceType = String;

/// Display-ready projection of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
    pub key: ReferenceId,
    pub label: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ReferenceItem {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: key.into(),
            label: name.clone(),
            name,
            icon: None,
            color: None,
            data: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Filter operators understood by the backend query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    In,
    Eq,
}

/// A single `{k, v, o}` filter entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub k: String,
    pub v: Value,
    pub o: FilterOperator,
}

impl Filter {
    /// Constrains `field` to be one of `ids`.
    pub fn any_of(field: impl Into<String>, ids: &[ReferenceId]) -> Self {
        Self {
            k: field.into(),
            v: Value::from(ids.to_vec()),
            o: FilterOperator::In,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            k: field.into(),
            v: value.into(),
            o: FilterOperator::Eq,
        }
    }
}

/// Static query fragment merged into every list call of a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<String>>,
}

impl ListQuery {
    /// Returns a copy of this query with `extra` appended to its filters.
    pub fn with_filter(&self, extra: Filter) -> Self {
        let mut query = self.clone();
        query.filter.push(extra);
        query
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListParams {
    pub query: ListQuery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
}

impl<T> Default for ListResponse<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            total_count: None,
        }
    }
}

/// Options for a full (unfiltered) load of a resource type.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Reload even when the last load is still within its TTL
    pub force: bool,
    /// Skip the load entirely when any items are already resolved
    pub lazy_load: bool,
}

/// Describes a resource type together with its currently resolved items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceTypeInfo {
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Name of the ID field on the raw resource (e.g. `project_id`)
    pub key: String,
    /// Human readable name of the resource type
    pub name: String,
    pub reference_map: HashMap<ReferenceId, ReferenceItem>,
}
