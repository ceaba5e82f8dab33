//! The record flowing through a pipeline, one per sample or batch

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::Value;

/// A named-field bundle representing one sample or one batch
///
/// Records are created by the root data source and threaded stage by stage,
/// each stage adding or overwriting fields. Required fields are a
/// precondition of the stage that reads them; a missing field is a contract
/// failure, not a recoverable condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, overwriting any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Get a field if present
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a mutable field if present
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.get_mut(name)
    }

    /// Remove and return a field if present
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Whether the record carries the named field
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Get a required field, failing the stage contract if absent
    pub fn require(&self, stage: &str, name: &str) -> Result<&Value> {
        self.fields.get(name).ok_or_else(|| Error::MissingField {
            stage: stage.to_string(),
            field: name.to_string(),
        })
    }

    /// Iterate over all fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The `metrics` sub-mapping, created on first access
    pub fn metrics_mut(&mut self) -> &mut BTreeMap<String, Value> {
        let entry = self
            .fields
            .entry("metrics".to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));

        // `metrics` is reserved for the sub-mapping
        if !matches!(entry, Value::Map(_)) {
            *entry = Value::Map(BTreeMap::new());
        }
        match entry {
            Value::Map(m) => m,
            _ => unreachable!(),
        }
    }

    /// The `metrics` sub-mapping, if any stage has populated it
    pub fn metrics(&self) -> Option<&BTreeMap<String, Value>> {
        match self.fields.get("metrics") {
            Some(Value::Map(m)) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_present_and_missing() {
        let mut rec = Record::new();
        rec.set("target", 7i64);

        assert_eq!(rec.require("Trainer", "target").unwrap().as_int().unwrap(), 7);

        let err = rec.require("Trainer", "image").unwrap_err();
        assert!(matches!(err, Error::MissingField { .. }));
    }

    #[test]
    fn test_metrics_created_on_demand() {
        let mut rec = Record::new();
        assert!(rec.metrics().is_none());

        rec.metrics_mut()
            .insert("loss".to_string(), Value::Float(0.5));
        assert_eq!(
            rec.metrics().unwrap().get("loss"),
            Some(&Value::Float(0.5))
        );
    }
}
