/**
 * Reactive key-value store holding one slot per live subscription
 *
 * Every slot is a `tokio::sync::watch` channel: `get` reads the current
 * value, `dispatch` applies a store event atomically and notifies
 * subscribers only when the consumer-visible state changed.
 */
use super::errors::WatchError;
use super::query::SubscriptionId;
use k8s_openapi::serde_json::Value;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Resolved data for one subscription
#[derive(Debug, Clone, PartialEq)]
pub enum WatchData {
    List(Vec<Value>),
    Object(Value),
}

impl WatchData {
    /// Empty collection for list watches, empty object for object watches
    #[must_use]
    pub fn empty(object: bool) -> Self {
        if object {
            Self::Object(Value::Object(k8s_openapi::serde_json::Map::new()))
        } else {
            Self::List(Vec::new())
        }
    }

    #[must_use]
    pub fn items(&self) -> &[Value] {
        match self {
            Self::List(items) => items,
            Self::Object(_) => &[],
        }
    }

    #[must_use]
    pub const fn object(&self) -> Option<&Value> {
        match self {
            Self::Object(object) => Some(object),
            Self::List(_) => None,
        }
    }
}

/// One streamed change to a watched collection or object
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Added(Value),
    Modified(Value),
    Deleted(Value),
}

impl Change {
    #[must_use]
    pub const fn object(&self) -> &Value {
        match self {
            Self::Added(v) | Self::Modified(v) | Self::Deleted(v) => v,
        }
    }
}

/// Consumer-facing store events
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Started,
    /// First page of a list read, or the whole object
    Replace {
        data: WatchData,
        resource_version: Option<String>,
        complete: bool,
    },
    /// Subsequent page of a list read
    Append {
        items: Vec<Value>,
        resource_version: Option<String>,
        complete: bool,
    },
    /// One or more streamed changes, applied as a single mutation
    Modified(Vec<Change>),
    Bookmark(String),
    Error(WatchError),
    Stopped,
}

/// Current state of one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSlot {
    pub data: WatchData,
    pub loaded: bool,
    /// Every page of the initial read has landed
    pub complete: bool,
    pub load_error: Option<WatchError>,
    pub resource_version: Option<String>,
    pub active: bool,
    /// Registry lifetime this slot belongs to; a re-acquired id gets a new one
    pub generation: u64,
    /// Bumped on every consumer-visible change
    pub revision: u64,
}

impl WatchSlot {
    #[must_use]
    pub fn new(object: bool) -> Self {
        Self {
            data: WatchData::empty(object),
            loaded: false,
            complete: false,
            load_error: None,
            resource_version: None,
            active: false,
            generation: 0,
            revision: 0,
        }
    }

    #[must_use]
    pub const fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Apply one event; returns whether consumers should be notified
    pub fn apply(&mut self, event: StoreEvent) -> bool {
        let changed = match event {
            StoreEvent::Started => {
                self.active = true;
                true
            }
            StoreEvent::Replace {
                data,
                resource_version,
                complete,
            } => {
                self.data = data;
                self.loaded = true;
                self.complete = complete;
                self.load_error = None;
                self.resource_version = resource_version;
                true
            }
            StoreEvent::Append {
                items,
                resource_version,
                complete,
            } => match &mut self.data {
                WatchData::List(existing) => {
                    existing.extend(items);
                    self.complete = complete;
                    self.resource_version = resource_version;
                    true
                }
                WatchData::Object(_) => {
                    debug!("⚠️  Ignoring page append on an object watch");
                    false
                }
            },
            StoreEvent::Modified(changes) => {
                for change in changes {
                    self.apply_change(change);
                }
                true
            }
            StoreEvent::Bookmark(resource_version) => {
                self.resource_version = Some(resource_version);
                false
            }
            StoreEvent::Error(error) => {
                self.load_error = Some(error);
                true
            }
            StoreEvent::Stopped => {
                self.active = false;
                true
            }
        };
        if changed {
            self.revision += 1;
        }
        changed
    }

    fn apply_change(&mut self, change: Change) {
        if let Some(rv) = resource_version_of(change.object()) {
            self.resource_version = Some(rv.to_string());
        }
        match &mut self.data {
            WatchData::List(items) => {
                let key = object_key(change.object());
                let position = items.iter().position(|item| object_key(item) == key);
                match (change, position) {
                    (Change::Added(obj) | Change::Modified(obj), Some(i)) => items[i] = obj,
                    (Change::Added(obj) | Change::Modified(obj), None) => items.push(obj),
                    (Change::Deleted(_), Some(i)) => {
                        items.remove(i);
                    }
                    (Change::Deleted(_), None) => {}
                }
            }
            WatchData::Object(current) => match change {
                Change::Added(obj) | Change::Modified(obj) => {
                    *current = obj;
                    self.load_error = None;
                }
                Change::Deleted(obj) => {
                    self.load_error = Some(WatchError::NotFound(object_key(&obj)));
                }
            },
        }
    }
}

/// Identity of an object inside a collection: uid, else namespace/name
#[must_use]
pub fn object_key(object: &Value) -> String {
    let metadata = &object["metadata"];
    if let Some(uid) = metadata["uid"].as_str() {
        return uid.to_string();
    }
    let name = metadata["name"].as_str().unwrap_or_default();
    metadata["namespace"]
        .as_str()
        .map_or_else(|| name.to_string(), |ns| format!("{ns}/{name}"))
}

#[must_use]
pub fn resource_version_of(object: &Value) -> Option<&str> {
    object["metadata"]["resourceVersion"].as_str()
}

/// Key-value store of subscription slots
#[derive(Debug, Default)]
pub struct ResourceStore {
    slots: RwLock<HashMap<SubscriptionId, watch::Sender<WatchSlot>>>,
}

impl ResourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &SubscriptionId) -> Option<WatchSlot> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(id).map(|tx| tx.borrow().clone())
    }

    /// Insert or overwrite a slot, notifying existing subscribers
    pub fn set(&self, id: &SubscriptionId, slot: WatchSlot) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.get(id) {
            Some(tx) => {
                tx.send_replace(slot);
            }
            None => {
                slots.insert(id.clone(), watch::Sender::new(slot));
            }
        }
    }

    #[must_use]
    pub fn subscribe(&self, id: &SubscriptionId) -> Option<watch::Receiver<WatchSlot>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(id).map(watch::Sender::subscribe)
    }

    /// Apply an event to a slot. Returns false when the slot does not exist.
    pub fn dispatch(&self, id: &SubscriptionId, event: StoreEvent) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = slots.get(id) else {
            trace!("No slot for {}, dropping event", id);
            return false;
        };
        tx.send_if_modified(|slot| slot.apply(event));
        true
    }

    /// Drop a slot; subscribers see their channel close after the last value
    pub fn remove(&self, id: &SubscriptionId) -> Option<WatchSlot> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.remove(id).map(|tx| tx.borrow().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
