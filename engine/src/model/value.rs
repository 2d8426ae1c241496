//! Runtime values and per-node output bags.

use std::collections::BTreeMap;
use std::collections::btree_map;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The conventional fallback port name used when a single unambiguous value
/// exists.
pub const DEFAULT_PORT: &str = "default";

/// Reserved key marking a value as a handle reference on the wire.
pub const HANDLE_KEY: &str = "_handleId";

/// Opaque reference to a heavy value resident in the handle store.
///
/// Serializes as `{"_handleId": "<id>"}`, distinguishable from inline data
/// by the presence of that single reserved key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleRef {
    #[serde(rename = "_handleId")]
    pub handle_id: Uuid,
}

impl HandleRef {
    pub fn new(handle_id: Uuid) -> Self {
        Self { handle_id }
    }
}

/// A value flowing along an edge: either inline data or a handle reference.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Handle(HandleRef),
    Data(serde_json::Value),
}

impl Value {
    /// Classify a raw JSON value, recognizing the handle reference wire
    /// shape (a single-key `{"_handleId": ...}` object).
    pub fn from_json(value: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(id)) = map.get(HANDLE_KEY) {
                    if let Ok(handle_id) = Uuid::parse_str(id) {
                        return Value::Handle(HandleRef::new(handle_id));
                    }
                }
            }
        }
        Value::Data(value)
    }

    /// Portable JSON representation (handle references keep their wire
    /// shape and are not dereferenced).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Handle(r) => {
                serde_json::json!({ HANDLE_KEY: r.handle_id.to_string() })
            }
            Value::Data(v) => v.clone(),
        }
    }

    pub fn data(value: serde_json::Value) -> Self {
        Value::Data(value)
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(v) => Some(v),
            Value::Handle(_) => None,
        }
    }

    pub fn as_handle(&self) -> Option<HandleRef> {
        match self {
            Value::Handle(r) => Some(*r),
            Value::Data(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(raw))
    }
}

/// The named-output map produced by one node's execution.
///
/// Resolution for a requested source port follows a fixed precedence:
/// exact key, else the `default` key, else (if exactly one entry exists)
/// that entry. This is the only place the fallback heuristics live.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct OutputBag {
    entries: BTreeMap<String, Value>,
}

impl OutputBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag holding a single value under the `default` port.
    pub fn single(value: Value) -> Self {
        let mut bag = Self::new();
        bag.insert(DEFAULT_PORT, value);
        bag
    }

    pub fn insert(&mut self, port: &str, value: Value) {
        self.entries.insert(port.to_string(), value);
    }

    pub fn get(&self, port: &str) -> Option<&Value> {
        self.entries.get(port)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// Resolve the value for a requested source port.
    pub fn resolve(&self, port: &str) -> Option<&Value> {
        if let Some(v) = self.entries.get(port) {
            return Some(v);
        }
        if let Some(v) = self.entries.get(DEFAULT_PORT) {
            return Some(v);
        }
        if self.entries.len() == 1 {
            return self.entries.values().next();
        }
        None
    }
}

impl FromIterator<(String, Value)> for OutputBag {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handle_ref_wire_shape() {
        let id = Uuid::new_v4();
        let value = Value::Handle(HandleRef::new(id));
        let wire = serde_json::to_value(&value).unwrap();
        assert_eq!(wire, json!({ "_handleId": id.to_string() }));

        let back: Value = serde_json::from_value(wire).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_from_json_keeps_plain_objects_inline() {
        let value = Value::from_json(json!({ "_handleId": "not-a-uuid" }));
        assert!(matches!(value, Value::Data(_)));

        let value = Value::from_json(json!({ "a": 1, "b": 2 }));
        assert!(matches!(value, Value::Data(_)));
    }

    #[test]
    fn test_resolve_exact_match_wins() {
        let mut bag = OutputBag::new();
        bag.insert("schematic", Value::data(json!(1)));
        bag.insert(DEFAULT_PORT, Value::data(json!(2)));
        assert_eq!(bag.resolve("schematic"), Some(&Value::data(json!(1))));
        assert_eq!(bag.resolve("other"), Some(&Value::data(json!(2))));
    }

    #[test]
    fn test_resolve_single_entry_fallback() {
        let mut bag = OutputBag::new();
        bag.insert("schematic", Value::data(json!("X")));
        // No "default" key; the single entry answers any port name.
        assert_eq!(bag.resolve(DEFAULT_PORT), Some(&Value::data(json!("X"))));
        assert_eq!(bag.resolve("output"), Some(&Value::data(json!("X"))));
    }

    #[test]
    fn test_resolve_ambiguous_is_none() {
        let mut bag = OutputBag::new();
        bag.insert("a", Value::data(json!(1)));
        bag.insert("b", Value::data(json!(2)));
        assert_eq!(bag.resolve("c"), None);
    }
}
