//! Mapping raw backend resources to [`ReferenceItem`]s.
//!
//! Every repository owns one [`ReferenceAdaptor`]. Adaptors are pure: they see one raw JSON
//! resource at a time and either produce an item or explain why they can't. A failing resource
//! is skipped by the repository, it never fails the whole batch.
//!
//! Besides the configurable [`FieldAdaptor`] there are built-in adaptors for the identity
//! resources every console references: projects, users and workspaces.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::config::{AdaptorKind, ResourceConfig};
use crate::errors::{Error, Result};
use crate::store::ReferenceMap;
use crate::types::ReferenceItem;

/// Maps one raw resource to a reference item.
pub trait ReferenceAdaptor: Send + Sync {
    fn adapt(&self, raw: &Value) -> Result<ReferenceItem>;
}

impl<F> ReferenceAdaptor for F
where
    F: Fn(&Value) -> Result<ReferenceItem> + Send + Sync,
{
    fn adapt(&self, raw: &Value) -> Result<ReferenceItem> {
        self(raw)
    }
}

/// Builds an adaptor that deserializes the raw resource into `T` before mapping it.
pub fn typed<T, F>(resource_type: impl Into<String>, map: F) -> impl ReferenceAdaptor
where
    T: DeserializeOwned,
    F: Fn(T) -> ReferenceItem + Send + Sync,
{
    let resource_type = resource_type.into();
    move |raw: &Value| -> Result<ReferenceItem> {
        let parsed = T::deserialize(raw).map_err(|e| Error::Adaptor {
            resource_type: resource_type.clone(),
            message: e.to_string(),
        })?;
        Ok(map(parsed))
    }
}

/// Picks the adaptor a configured resource asks for.
///
/// `store_map` looks up another resource type's map in the shared store; the project adaptor
/// uses it to label projects with their group.
pub fn for_resource(config: &ResourceConfig, store_map: impl Fn(&str) -> Arc<ReferenceMap>) -> Arc<dyn ReferenceAdaptor> {
    match config.adaptor {
        AdaptorKind::Fields => Arc::new(FieldAdaptor::from_config(config)),
        AdaptorKind::Project => Arc::new(ProjectAdaptor::new(Some(store_map("project_group")))),
        AdaptorKind::User => Arc::new(user_adaptor()),
        AdaptorKind::Workspace => Arc::new(workspace_adaptor()),
    }
}

/// Reads a possibly dotted field path (`tags.icon`) from a JSON object.
fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(raw, |value, segment| value.get(segment))
}

/// Text value of a possibly dotted field; numbers are rendered as text.
pub(crate) fn field_text(raw: &Value, path: &str) -> Option<String> {
    lookup(raw, path).and_then(as_text)
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Maps configured fields of the raw resource onto the item.
///
/// The whole raw resource is kept as the item's `data`.
#[derive(Debug, Clone)]
pub struct FieldAdaptor {
    resource_type: String,
    id_field: String,
    name_field: String,
    label_field: Option<String>,
    icon_field: Option<String>,
}

impl FieldAdaptor {
    pub fn new(resource_type: impl Into<String>, id_field: impl Into<String>, name_field: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id_field: id_field.into(),
            name_field: name_field.into(),
            label_field: None,
            icon_field: None,
        }
    }

    pub fn from_config(config: &ResourceConfig) -> Self {
        Self {
            resource_type: config.resource_type.clone(),
            id_field: config.id_field.clone(),
            name_field: config.name_field.clone(),
            label_field: config.label_field.clone(),
            icon_field: config.icon_field.clone(),
        }
    }

    pub fn with_label_field(mut self, field: impl Into<String>) -> Self {
        self.label_field = Some(field.into());
        self
    }

    pub fn with_icon_field(mut self, field: impl Into<String>) -> Self {
        self.icon_field = Some(field.into());
        self
    }
}

impl ReferenceAdaptor for FieldAdaptor {
    fn adapt(&self, raw: &Value) -> Result<ReferenceItem> {
        let key = lookup(raw, &self.id_field)
            .and_then(as_text)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Adaptor {
                resource_type: self.resource_type.clone(),
                message: format!("missing or empty '{}'", self.id_field),
            })?;

        // Unnamed resources are displayed by their ID
        let name = lookup(raw, &self.name_field).and_then(as_text).unwrap_or_else(|| key.clone());

        let mut item = ReferenceItem::new(key, name);
        if let Some(label) = self.label_field.as_deref().and_then(|field| lookup(raw, field)).and_then(as_text) {
            item = item.with_label(label);
        }
        if let Some(icon) = self.icon_field.as_deref().and_then(|field| lookup(raw, field)).and_then(as_text) {
            item = item.with_icon(icon);
        }
        Ok(item.with_data(raw.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct ProjectResource {
    project_id: String,
    name: String,
    #[serde(default)]
    project_group_id: Option<String>,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default)]
    project_type: Option<String>,
    #[serde(default)]
    workspace_id: Option<String>,
}

/// Field of a raw project holding its group's ID.
pub const PROJECT_GROUP_FIELD: &str = "project_group_id";

/// Projects are labelled `"<group name> > <project name>"` when their group is known.
pub struct ProjectAdaptor {
    groups: Option<Arc<ReferenceMap>>,
}

impl ProjectAdaptor {
    pub fn new(groups: Option<Arc<ReferenceMap>>) -> Self {
        Self { groups }
    }
}

impl ReferenceAdaptor for ProjectAdaptor {
    fn adapt(&self, raw: &Value) -> Result<ReferenceItem> {
        let project = ProjectResource::deserialize(raw).map_err(|e| Error::Adaptor {
            resource_type: "project".to_string(),
            message: e.to_string(),
        })?;

        let group = project
            .project_group_id
            .as_deref()
            .zip(self.groups.as_ref())
            .and_then(|(group_id, groups)| groups.get(group_id));

        let label = match &group {
            Some(group) => format!("{} > {}", group.name, project.name),
            None => project.name.clone(),
        };
        let data = json!({
            "group_info": group.as_ref().map(|g| json!({"id": g.key, "name": g.name})),
            "users": project.users,
            "project_type": project.project_type,
            "workspace_id": project.workspace_id,
        });

        Ok(ReferenceItem::new(project.project_id, project.name).with_label(label).with_data(data))
    }
}

#[derive(Debug, Deserialize)]
struct UserResource {
    user_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    role_binding_info: Option<Value>,
}

/// Users are labelled `"<user id> (<name>)"`, or just the ID when they have no name.
pub fn user_adaptor() -> impl ReferenceAdaptor {
    typed("user", |user: UserResource| {
        let name = user.name.filter(|n| !n.is_empty());
        let label = match &name {
            Some(name) => format!("{} ({name})", user.user_id),
            None => user.user_id.clone(),
        };
        let item = ReferenceItem::new(user.user_id, name.unwrap_or_default()).with_label(label);
        match user.role_binding_info {
            Some(role) => item.with_data(json!({ "role_info": role })),
            None => item,
        }
    })
}

#[derive(Debug, Deserialize)]
struct WorkspaceResource {
    workspace_id: String,
    name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    tags: Value,
    #[serde(default)]
    user_count: Option<u64>,
    #[serde(default)]
    service_account_count: Option<u64>,
    #[serde(default)]
    created_at: Option<String>,
}

/// Workspaces are labelled by name; a `theme` tag becomes the item color.
pub fn workspace_adaptor() -> impl ReferenceAdaptor {
    typed("workspace", |workspace: WorkspaceResource| {
        let theme = workspace.tags.get("theme").and_then(Value::as_str).map(str::to_string);
        let item = ReferenceItem::new(workspace.workspace_id, workspace.name).with_data(json!({
            "state": workspace.state,
            "tags": workspace.tags,
            "user_count": workspace.user_count,
            "service_account_count": workspace.service_account_count,
            "created_at": workspace.created_at,
        }));
        match theme {
            Some(theme) => item.with_color(theme),
            None => item,
        }
    })
}
