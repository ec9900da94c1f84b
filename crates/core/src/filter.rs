//! Metadata filter
//!
//! Equality conditions over item metadata. Backends translate this into
//! their native filter language; in-process backends use `matches`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::item::Metadata;

/// Conjunction of `key == value` conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub equals: BTreeMap<String, Value>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn item_type(self, item_type: impl Into<String>) -> Self {
        self.eq(crate::keys::TYPE, item_type.into())
    }

    pub fn topic(self, topic: impl Into<String>) -> Self {
        self.eq(crate::keys::TOPIC, topic.into())
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    /// Whether every condition holds for the given metadata
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals.iter().all(|(key, expected)| match metadata.get(key) {
            Some(actual) => values_equal(actual, expected),
            None => false,
        })
    }
}

/// Numbers compare by value so `1` matches `1.0`
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(SearchFilter::new().matches(&Metadata::new()));
    }

    #[test]
    fn test_conjunction() {
        let filter = SearchFilter::new().item_type("note").eq("pinned", true);
        let mut meta = Metadata::new();
        meta.insert("type".into(), json!("note"));
        assert!(!filter.matches(&meta));

        meta.insert("pinned".into(), json!(true));
        assert!(filter.matches(&meta));
    }

    #[test]
    fn test_numeric_equality_ignores_representation() {
        let filter = SearchFilter::new().eq("source_tier", 1);
        let mut meta = Metadata::new();
        meta.insert("source_tier".into(), json!(1.0));
        assert!(filter.matches(&meta));
    }
}
