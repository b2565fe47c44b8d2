//! Key/value memory shared between tool handlers and the UI

use crate::events::{EventBus, SessionEvent};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Shared memory store, read by the UI and written by tools
///
/// Last writer wins per key; there is no transactional grouping of writes.
#[derive(Clone, Default)]
pub struct SharedMemory {
    entries: Arc<RwLock<BTreeMap<String, Value>>>,
    events: Option<EventBus>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that announces changes on the event bus
    pub fn with_events(events: EventBus) -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            events: Some(events),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        let was_empty = {
            let mut entries = self.entries.write();
            let was_empty = entries.is_empty();
            entries.clear();
            was_empty
        };

        if !was_empty {
            debug!("Shared memory cleared");
            self.notify();
        }
    }

    /// Mutator handed to tool handlers
    pub fn writer(&self) -> MemoryWriter {
        MemoryWriter {
            memory: self.clone(),
        }
    }

    fn notify(&self) {
        if let Some(events) = &self.events {
            events.publish(SessionEvent::MemoryUpdated);
        }
    }
}

/// The only way tool handlers change UI-visible state
#[derive(Clone)]
pub struct MemoryWriter {
    memory: SharedMemory,
}

impl MemoryWriter {
    /// Replace the value under `key`
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        debug!("Memory set: {}", key);
        self.memory.entries.write().insert(key, value);
        self.memory.notify();
    }

    /// Remove `key`, returning its old value
    pub fn remove(&self, key: &str) -> Option<Value> {
        let removed = self.memory.entries.write().remove(key);
        if removed.is_some() {
            self.memory.notify();
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.memory.get(key)
    }
}
