use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Variable bag shared by the nodes of one execution.
///
/// Keys are strings; values are JSON. Dotted paths (`order.total`) reach into
/// nested objects when reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables {
    data: HashMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    /// Get a top-level value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Resolve a dotted path. An exact top-level key wins over a path split.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.data.get(path) {
            return Some(v);
        }
        let mut parts = path.split('.');
        let mut current = self.data.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    /// Merge another bag into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &Variables) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Copy mapped outputs of a finished node into the bag.
    ///
    /// `mappings` is variable name → output key. When the key is missing
    /// from `outputs` but the `content` output is a JSON object holding it,
    /// that field is used instead.
    pub fn apply_outputs(
        &mut self,
        mappings: &HashMap<String, String>,
        outputs: &HashMap<String, Value>,
    ) {
        for (var, key) in mappings {
            if let Some(v) = outputs.get(key) {
                self.data.insert(var.clone(), v.clone());
                continue;
            }
            let field = outputs
                .get("content")
                .and_then(Value::as_str)
                .and_then(|text| serde_json::from_str::<Value>(text).ok())
                .and_then(|json| json.get(key).cloned());
            if let Some(v) = field {
                self.data.insert(var.clone(), v);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.data
    }
}

impl FromIterator<(String, Value)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

/// Render a value the way it appears inside an agent message: strings raw,
/// everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut vars = Variables::new();
        vars.set_str("name", "Alice");
        vars.set("count", json!(42));

        assert_eq!(vars.get_str("name"), Some("Alice"));
        assert_eq!(vars.get("count"), Some(&json!(42)));
        assert_eq!(vars.get("missing"), None);
    }

    #[test]
    fn test_dotted_lookup() {
        let mut vars = Variables::new();
        vars.set("order", json!({"total": 120, "items": [{"sku": "a1"}]}));
        vars.set("plain.key", json!("literal"));

        assert_eq!(vars.lookup("order.total"), Some(&json!(120)));
        assert_eq!(vars.lookup("order.items.0.sku"), Some(&json!("a1")));
        assert_eq!(vars.lookup("plain.key"), Some(&json!("literal")));
        assert_eq!(vars.lookup("order.missing"), None);
    }

    #[test]
    fn test_merge() {
        let mut a = Variables::new();
        a.set_str("a", "1");
        a.set_str("b", "2");

        let mut b = Variables::new();
        b.set_str("b", "overwritten");
        b.set_str("c", "3");

        a.merge(&b);

        assert_eq!(a.get_str("a"), Some("1"));
        assert_eq!(a.get_str("b"), Some("overwritten"));
        assert_eq!(a.get_str("c"), Some("3"));
    }

    #[test]
    fn test_apply_outputs_direct_and_json_field() {
        let mut vars = Variables::new();
        let outputs: HashMap<String, Value> = [(
            "content".to_string(),
            json!(r#"{"findings": "Rust is fast", "score": 9.5}"#),
        )]
        .into_iter()
        .collect();
        let mappings: HashMap<String, String> = [
            ("raw".to_string(), "content".to_string()),
            ("score".to_string(), "score".to_string()),
        ]
        .into_iter()
        .collect();

        vars.apply_outputs(&mappings, &outputs);

        assert!(vars.get_str("raw").unwrap().contains("findings"));
        assert_eq!(vars.get("score"), Some(&json!(9.5)));
    }

    #[test]
    fn test_apply_outputs_ignores_missing_keys() {
        let mut vars = Variables::new();
        let outputs: HashMap<String, Value> =
            [("content".to_string(), json!("plain text"))].into_iter().collect();
        let mappings: HashMap<String, String> =
            [("x".to_string(), "nope".to_string())].into_iter().collect();
        vars.apply_outputs(&mappings, &outputs);
        assert!(vars.is_empty());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!("hi")), "hi");
        assert_eq!(value_to_text(&json!(3)), "3");
        assert_eq!(value_to_text(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
