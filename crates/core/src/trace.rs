//! Retrieval trace
//!
//! An ordered list of stage events. Each event carries counts, timings and
//! (when explain is requested) sample scores, so a diagnostics endpoint can
//! render "why was this retrieved".

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single stage event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl TraceEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            meta: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }
}

/// Ordered stage events for one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        tracing::trace!(event = %event.event, meta = ?event.meta, "retrieval stage");
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// First event with the given name
    pub fn find(&self, name: &str) -> Option<&TraceEvent> {
        self.events.iter().find(|e| e.event == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.event.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.events
                .iter()
                .map(|e| {
                    let mut obj = Map::new();
                    obj.insert("event".to_string(), Value::String(e.event.clone()));
                    obj.insert("meta".to_string(), Value::Object(e.meta.clone()));
                    Value::Object(obj)
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_order_and_lookup() {
        let mut trace = Trace::new();
        trace.push(TraceEvent::new("budget").with("intent", "chat"));
        trace.push(TraceEvent::new("hybrid").with("dense", 1).with("sparse", 2));

        assert_eq!(trace.names(), vec!["budget", "hybrid"]);
        let hybrid = trace.find("hybrid").unwrap();
        assert_eq!(hybrid.get("sparse").and_then(Value::as_u64), Some(2));
        assert!(trace.find("mmr").is_none());
    }

    #[test]
    fn test_trace_serializes_as_array() {
        let mut trace = Trace::new();
        trace.push(TraceEvent::new("trim").with("kept", 3));

        let json = serde_json::to_value(&trace).unwrap();
        assert!(json.is_array());
        assert_eq!(json, trace.to_json());
        assert_eq!(json[0]["event"], "trim");
        assert_eq!(json[0]["meta"]["kept"], 3);
    }
}
