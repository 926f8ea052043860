//! Shared, observable storage for resolved references.
//!
//! A [`ReferenceStore`] is the process-wide cache client: it hands out one [`ReferenceMap`] per
//! namespace (cache key base + resource type). A map holds a slot per requested ID, either a
//! placeholder for an ID that was requested but is not resolved yet, or the resolved
//! [`ReferenceItem`]. Every change that consumers may want to react to is broadcast as a
//! [`ReferenceEvent`].

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::types::{ReferenceId, ReferenceItem};

/// Buffered events per map before slow subscribers start lagging
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceSlot {
    /// Requested, not resolved (pending, or absent from the last response)
    Placeholder,
    Resolved(ReferenceItem),
}

impl ReferenceSlot {
    pub fn item(&self) -> Option<&ReferenceItem> {
        match self {
            ReferenceSlot::Placeholder => None,
            ReferenceSlot::Resolved(item) => Some(item),
        }
    }
}

/// Change notifications for a single reference map.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceEvent {
    /// A consumer read an ID the map had never seen
    Requested(ReferenceId),
    /// Items were merged into the map
    Resolved(Vec<ReferenceId>),
    /// A bulk fetch for these IDs failed; their placeholders were released
    Failed(Vec<ReferenceId>),
    /// The fetch cycle for these IDs finished, whatever its outcome
    Settled(Vec<ReferenceId>),
    /// The whole map was cleared
    Invalidated,
}

/// ID → slot map for one resource type.
#[derive(Debug)]
pub struct ReferenceMap {
    namespace: String,
    slots: DashMap<ReferenceId, ReferenceSlot>,
    events: broadcast::Sender<ReferenceEvent>,
}

impl ReferenceMap {
    pub fn new(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            namespace: namespace.into(),
            slots: DashMap::new(),
            events,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The resolved item for `key`, if any.
    pub fn get(&self, key: &str) -> Option<ReferenceItem> {
        self.slots.get(key).and_then(|slot| slot.item().cloned())
    }

    pub fn slot(&self, key: &str) -> Option<ReferenceSlot> {
        self.slots.get(key).map(|slot| slot.clone())
    }

    /// Whether `key` has any slot, resolved or placeholder.
    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn is_resolved(&self, key: &str) -> bool {
        matches!(self.slots.get(key).as_deref(), Some(ReferenceSlot::Resolved(_)))
    }

    /// Inserts a placeholder for `key` unless it already has a slot.
    ///
    /// Returns `true` if the placeholder was inserted, i.e. this is the first request for `key`.
    pub fn insert_placeholder(&self, key: &str) -> bool {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(ReferenceSlot::Placeholder);
                true
            }
        }
    }

    /// Stores `items` keyed by their `key`, replacing placeholders and older items.
    ///
    /// Returns the keys that were written.
    pub fn merge(&self, items: impl IntoIterator<Item = ReferenceItem>) -> Vec<ReferenceId> {
        items
            .into_iter()
            .map(|item| self.upsert(item))
            .collect()
    }

    /// Stores a single item, replacing whatever slot `item.key` had.
    pub fn upsert(&self, item: ReferenceItem) -> ReferenceId {
        let key = item.key.clone();
        self.slots.insert(key.clone(), ReferenceSlot::Resolved(item));
        key
    }

    /// Replaces every resolved item with `items`. Placeholders of outstanding requests survive.
    pub fn replace_all(&self, items: impl IntoIterator<Item = ReferenceItem>) -> Vec<ReferenceId> {
        self.slots.retain(|_, slot| matches!(slot, ReferenceSlot::Placeholder));
        self.merge(items)
    }

    /// Removes the slots of `keys` that are still placeholders. Resolved items are kept.
    pub fn release_placeholders(&self, keys: &[ReferenceId]) -> usize {
        keys.iter()
            .filter(|key| {
                self.slots
                    .remove_if(key.as_str(), |_, slot| matches!(slot, ReferenceSlot::Placeholder))
                    .is_some()
            })
            .count()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Snapshot of every resolved item.
    pub fn resolved(&self) -> HashMap<ReferenceId, ReferenceItem> {
        self.slots
            .iter()
            .filter_map(|entry| entry.value().item().map(|item| (entry.key().clone(), item.clone())))
            .collect()
    }

    /// Number of slots, placeholders included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn resolved_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), ReferenceSlot::Resolved(_)))
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReferenceEvent> {
        self.events.subscribe()
    }

    /// Broadcasts `event`. Having no subscribers is not an error.
    pub fn emit(&self, event: ReferenceEvent) {
        let _ = self.events.send(event);
    }
}

/// Namespace → reference map. Shared by every repository of a registry.
#[derive(Debug, Default)]
pub struct ReferenceStore {
    maps: DashMap<String, Arc<ReferenceMap>>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the namespace of a resource type under a cache key base.
    pub fn namespace(cache_key_base: &str, resource_type: &str) -> String {
        format!("{cache_key_base}/{resource_type}")
    }

    /// The map for `namespace`, created empty on first use.
    pub fn map(&self, namespace: &str) -> Arc<ReferenceMap> {
        self.maps
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(ReferenceMap::new(namespace)))
            .clone()
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<ReferenceMap>> {
        self.maps.get(namespace).map(|map| map.clone())
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.maps.iter().map(|entry| entry.key().clone()).collect()
    }
}
