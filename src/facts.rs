//! Per-cycle fact snapshot.
//!
//! A [`FactStore`] is populated by the fact-extractors before reconciliation
//! runs and is read-only afterwards. A failed extractor simply leaves its
//! keys absent; every getter tolerates absence, so downstream rules treat
//! missing facts as falsy/unknown rather than crashing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single typed fact value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
    Record(serde_json::Value),
}

impl From<bool> for FactValue {
    fn from(v: bool) -> Self {
        FactValue::Bool(v)
    }
}

impl From<i64> for FactValue {
    fn from(v: i64) -> Self {
        FactValue::Int(v)
    }
}

impl From<&str> for FactValue {
    fn from(v: &str) -> Self {
        FactValue::Str(v.to_string())
    }
}

impl From<String> for FactValue {
    fn from(v: String) -> Self {
        FactValue::Str(v)
    }
}

impl From<Vec<String>> for FactValue {
    fn from(v: Vec<String>) -> Self {
        FactValue::List(v)
    }
}

/// Immutable mapping from fact name to value for one reconciliation cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactStore {
    facts: BTreeMap<String, FactValue>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fact. Population happens before reconciliation; the engine
    /// never writes.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FactValue>) {
        self.facts.insert(name.into(), value.into());
    }

    /// Merge another partial fact map into this one. Later extractors win on
    /// key collision, mirroring dict-update population order.
    pub fn merge(&mut self, other: FactStore) {
        self.facts.extend(other.facts);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.facts.contains_key(name)
    }

    /// Boolean fact; absent or non-boolean reads as false.
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.facts.get(name), Some(FactValue::Bool(true)))
    }

    /// String fact; absent or non-string reads as None.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.facts.get(name) {
            Some(FactValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer fact; absent or non-integer reads as None.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.facts.get(name) {
            Some(FactValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// List fact; absent or non-list reads as an empty slice.
    pub fn get_list(&self, name: &str) -> &[String] {
        match self.facts.get(name) {
            Some(FactValue::List(v)) => v,
            _ => &[],
        }
    }

    /// Structured fact; absent reads as None.
    pub fn get_record(&self, name: &str) -> Option<&serde_json::Value> {
        match self.facts.get(name) {
            Some(FactValue::Record(v)) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Serialize the whole store for the per-item snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.facts).unwrap_or(serde_json::Value::Null)
    }
}
