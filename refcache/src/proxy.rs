//! Lazy read access to a repository.
//!
//! Reading through a [`ReferenceProxy`] returns whatever is resolved right now and makes sure
//! the ID is on its way if it has never been asked for. It never blocks and never fetches an ID
//! twice; callers re-read after a [`ReferenceEvent::Resolved`](crate::store::ReferenceEvent)
//! notification.

use std::sync::Arc;

use crate::repository::ReferenceRepository;
use crate::types::ReferenceItem;

#[derive(Debug, Clone)]
pub struct ReferenceProxy {
    repository: Arc<ReferenceRepository>,
}

impl ReferenceProxy {
    pub fn new(repository: Arc<ReferenceRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<ReferenceRepository> {
        &self.repository
    }

    /// The resolved item for `key`.
    ///
    /// The first read of an unknown key requests it and returns `None`; reads of a key that is
    /// still being fetched return `None` without requesting it again.
    pub fn read(&self, key: &str) -> Option<ReferenceItem> {
        if let Some(item) = self.repository.get(key) {
            return Some(item);
        }
        self.repository.ensure_requested(key);
        None
    }

    /// The label for `key`, or the key itself until it resolves.
    pub fn read_label(&self, key: &str) -> String {
        self.read(key).map(|item| item.label).unwrap_or_else(|| key.to_string())
    }
}
