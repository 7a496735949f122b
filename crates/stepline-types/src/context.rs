//! Accumulated key/value memory of one workflow execution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key/value accumulator threaded through every step of one execution.
///
/// Keys are only ever added or overwritten, never removed. The context is
/// stored as a JSON object so it can be persisted and carried in queued
/// messages unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowContext(Map<String, Value>);

impl WorkflowContext {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Look up a string value. Values of any other JSON type report `None`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Insert or overwrite a single key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Merge step output into the context, overwriting existing keys.
    pub fn merge(&mut self, data: Map<String, Value>) {
        for (key, value) in data {
            self.0.insert(key, value);
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Borrow the context as a JSON object map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a `serde_json::Value::Object`.
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for WorkflowContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_str_ignores_non_string_values() {
        let mut ctx = WorkflowContext::new();
        ctx.set("email", "u@x.com");
        ctx.set("count", 3);

        assert_eq!(ctx.get_str("email"), Some("u@x.com"));
        assert_eq!(ctx.get_str("count"), None);
        assert_eq!(ctx.get("count"), Some(&json!(3)));
        assert_eq!(ctx.get_str("missing"), None);
    }

    #[test]
    fn test_merge_overwrites_and_never_removes() {
        let mut ctx = WorkflowContext::new();
        ctx.set("a", 1);
        ctx.set("b", "old");

        let mut data = Map::new();
        data.insert("b".to_string(), json!("new"));
        data.insert("c".to_string(), json!(true));
        ctx.merge(data);

        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.get("a"), Some(&json!(1)));
        assert_eq!(ctx.get_str("b"), Some("new"));
        assert_eq!(ctx.get("c"), Some(&json!(true)));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let mut ctx = WorkflowContext::new();
        ctx.set("user_id", "u-1");
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, json!({"user_id": "u-1"}));

        let parsed: WorkflowContext = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
