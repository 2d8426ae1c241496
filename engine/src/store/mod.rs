//! Handle store: an LRU-bounded registry for heavy in-process values.
//!
//! Script runs produce objects (scenes, schematics, large buffers) that
//! must not be copied across the execution boundary on every hop. The
//! store owns them exclusively, hands out opaque handle ids, and
//! serializes a value only when a consumer outside the engine asks for it.
//!
//! All mutation happens on the coordinator's control flow; the store is
//! not shared across threads.

use std::time::SystemTime;

use log::debug;
use lru::LruCache;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, StoreError};

const DEFAULT_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// A heavy value owned by the store.
pub trait HeavyObject: Send {
    /// Estimated resident size in bytes.
    fn byte_size(&self) -> usize;

    /// Convert to a portable representation (the value's own export
    /// routine).
    fn export(&self) -> Result<serde_json::Value, EngineError>;
}

/// Raw byte buffer; size is the buffer length, export is a hex string.
pub struct RawBuffer(pub Vec<u8>);

impl HeavyObject for RawBuffer {
    fn byte_size(&self) -> usize {
        self.0.len()
    }

    fn export(&self) -> Result<serde_json::Value, EngineError> {
        let mut hex = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            hex.push_str(&format!("{byte:02x}"));
        }
        Ok(serde_json::Value::String(hex))
    }
}

impl HeavyObject for serde_json::Value {
    fn byte_size(&self) -> usize {
        estimate_json_size(self)
    }

    fn export(&self) -> Result<serde_json::Value, EngineError> {
        Ok(self.clone())
    }
}

/// Structural size estimate for opaque JSON-shaped objects.
fn estimate_json_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 4,
        serde_json::Value::Bool(_) => 1,
        serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.len(),
        serde_json::Value::Array(items) => 8 + items.iter().map(estimate_json_size).sum::<usize>(),
        serde_json::Value::Object(map) => {
            8 + map
                .iter()
                .map(|(k, v)| k.len() + estimate_json_size(v))
                .sum::<usize>()
        }
    }
}

/// Immutable descriptor of a stored value.
#[derive(Serialize, Clone, Debug)]
pub struct Handle {
    pub id: Uuid,
    pub category: String,
    pub format: String,
    pub byte_size: usize,
    pub metadata: serde_json::Value,
    pub created_at: SystemTime,
}

/// Options for `HandleStore::store`.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub pinned: bool,
    pub category: String,
    pub metadata: serde_json::Value,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pinned: false,
            category: "object".to_string(),
            metadata: serde_json::Value::Null,
        }
    }
}

struct Entry {
    handle: Handle,
    object: Box<dyn HeavyObject>,
    pinned: bool,
}

/// LRU-bounded handle registry. Total tracked byte size always equals the
/// sum of live entries' recorded sizes.
pub struct HandleStore {
    entries: LruCache<Uuid, Entry>,
    budget: usize,
    used: usize,
}

impl HandleStore {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            budget: budget_bytes,
            used: 0,
        }
    }

    pub fn with_default_budget() -> Self {
        Self::new(DEFAULT_BUDGET_BYTES)
    }

    /// Insert a value, evicting least-recently-used unpinned entries until
    /// it fits. Fails only when the remaining entries are all pinned and
    /// space is still short.
    pub fn store(
        &mut self,
        object: Box<dyn HeavyObject>,
        format: &str,
        opts: StoreOptions,
    ) -> Result<Handle, EngineError> {
        let size = object.byte_size();
        while self.used + size > self.budget {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, e)| !e.pinned)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    if let Some(entry) = self.entries.pop(&id) {
                        self.used -= entry.handle.byte_size;
                        debug!(
                            "evicted handle {} ({} bytes, {} in use)",
                            id, entry.handle.byte_size, self.used
                        );
                    }
                }
                None => {
                    return Err(StoreError::CapacityExceeded {
                        needed: size,
                        budget: self.budget,
                        pinned: self.pinned_bytes(),
                    }
                    .into());
                }
            }
        }

        let handle = Handle {
            id: Uuid::new_v4(),
            category: opts.category,
            format: format.to_string(),
            byte_size: size,
            metadata: opts.metadata,
            created_at: SystemTime::now(),
        };
        self.used += size;
        self.entries.put(
            handle.id,
            Entry {
                handle: handle.clone(),
                object,
                pinned: opts.pinned,
            },
        );
        Ok(handle)
    }

    /// Live value lookup; refreshes recency. A miss is soft: unknown and
    /// evicted ids both return `None`.
    pub fn get(&mut self, id: Uuid) -> Option<&dyn HeavyObject> {
        self.entries.get(&id).map(|e| e.object.as_ref())
    }

    /// Export a stored value to its portable representation, or `None` if
    /// the handle is gone.
    pub fn serialize(&mut self, id: Uuid) -> Result<Option<serde_json::Value>, EngineError> {
        match self.entries.get(&id) {
            Some(entry) => entry.object.export().map(Some),
            None => Ok(None),
        }
    }

    pub fn handle(&self, id: Uuid) -> Option<&Handle> {
        self.entries.peek(&id).map(|e| &e.handle)
    }

    /// Drop a value. The only destructor path besides eviction.
    pub fn release(&mut self, id: Uuid) -> bool {
        match self.entries.pop(&id) {
            Some(entry) => {
                self.used -= entry.handle.byte_size;
                true
            }
            None => false,
        }
    }

    pub fn pin(&mut self, id: Uuid) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.pinned = true;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, id: Uuid) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.pinned = false;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn budget_bytes(&self) -> usize {
        self.budget
    }

    fn pinned_bytes(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, e)| e.pinned)
            .map(|(_, e)| e.handle.byte_size)
            .sum()
    }
}
