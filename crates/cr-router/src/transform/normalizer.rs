//! Per-command-type normalization hooks
//!
//! A registry maps command types to [`ResponseNormalizer`] implementations.
//! New command types register their own hook; command types without one get
//! their parsed data unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

pub trait ResponseNormalizer: Send + Sync {
    fn normalize(&self, data: Value) -> Value;
}

impl<F> ResponseNormalizer for F
where
    F: Fn(Value) -> Value + Send + Sync,
{
    fn normalize(&self, data: Value) -> Value {
        self(data)
    }
}

/// Page-scrape results: `content|text|html` become `content`, and
/// `url/title/description` are collected under `metadata`
pub struct ScrapeNormalizer;

impl ResponseNormalizer for ScrapeNormalizer {
    fn normalize(&self, data: Value) -> Value {
        let Value::Object(mut obj) = data else {
            return data;
        };

        if !obj.contains_key("content") {
            if let Some(content) = ["text", "html"].iter().find_map(|k| obj.get(*k).cloned()) {
                obj.insert("content".to_string(), content);
            }
        }

        let mut metadata = match obj.remove("metadata") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        for key in ["url", "title", "description"] {
            if let Some(value) = obj.get(key) {
                metadata.entry(key.to_string()).or_insert_with(|| value.clone());
            }
        }
        if !metadata.is_empty() {
            obj.insert("metadata".to_string(), Value::Object(metadata));
        }

        Value::Object(obj)
    }
}

/// Search results: `results|items|hits` become `results`, with `total` filled in
pub struct SearchNormalizer;

impl ResponseNormalizer for SearchNormalizer {
    fn normalize(&self, data: Value) -> Value {
        let mut obj = match data {
            Value::Array(items) => {
                let mut obj = Map::new();
                obj.insert("results".to_string(), Value::Array(items));
                obj
            }
            Value::Object(obj) => obj,
            other => return other,
        };

        if !obj.contains_key("results") {
            if let Some(results) = ["items", "hits"].iter().find_map(|k| obj.get(*k).filter(|v| v.is_array()).cloned()) {
                obj.insert("results".to_string(), results);
            }
        }
        if !obj.contains_key("total") {
            if let Some(count) = obj.get("results").and_then(Value::as_array).map(Vec::len) {
                obj.insert("total".to_string(), Value::from(count));
            }
        }

        Value::Object(obj)
    }
}

#[derive(Clone, Default)]
pub struct NormalizerRegistry {
    normalizers: HashMap<String, Arc<dyn ResponseNormalizer>>,
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `scrape` and `search` hooks installed
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("scrape", ScrapeNormalizer);
        registry.register("search", SearchNormalizer);
        registry
    }

    pub fn register(&mut self, command_type: impl Into<String>, normalizer: impl ResponseNormalizer + 'static) {
        self.normalizers.insert(command_type.into(), Arc::new(normalizer));
    }

    pub fn contains(&self, command_type: &str) -> bool {
        self.normalizers.contains_key(command_type)
    }

    pub fn normalize(&self, command_type: &str, data: Value) -> Value {
        match self.normalizers.get(command_type) {
            Some(normalizer) => normalizer.normalize(data),
            None => data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scrape_maps_content_and_metadata() {
        let data = json!({
            "html": "<p>hi</p>",
            "url": "https://example.com",
            "title": "Example",
            "metadata": {"lang": "en"}
        });
        let normalized = ScrapeNormalizer.normalize(data);

        assert_eq!(normalized["content"], "<p>hi</p>");
        assert_eq!(normalized["html"], "<p>hi</p>");
        assert_eq!(normalized["metadata"]["url"], "https://example.com");
        assert_eq!(normalized["metadata"]["title"], "Example");
        assert_eq!(normalized["metadata"]["lang"], "en");
    }

    #[test]
    fn test_scrape_keeps_existing_content() {
        let normalized = ScrapeNormalizer.normalize(json!({"content": "hello", "text": "other"}));
        assert_eq!(normalized, json!({"content": "hello", "text": "other"}));
    }

    #[test]
    fn test_search_wraps_arrays_and_counts() {
        assert_eq!(
            SearchNormalizer.normalize(json!([1, 2])),
            json!({"results": [1, 2], "total": 2})
        );
        let normalized = SearchNormalizer.normalize(json!({"hits": ["a"], "total": 40}));
        assert_eq!(normalized["results"], json!(["a"]));
        assert_eq!(normalized["total"], 40);
    }

    #[test]
    fn test_registry_dispatch_and_extension() {
        let mut registry = NormalizerRegistry::with_builtins();
        registry.register("summarize", |mut data: Value| {
            if let Some(obj) = data.as_object_mut() {
                obj.insert("normalized".to_string(), Value::Bool(true));
            }
            data
        });

        assert!(registry.contains("scrape"));
        assert_eq!(registry.normalize("summarize", json!({}))["normalized"], true);
        // Unknown command types pass through untouched
        assert_eq!(registry.normalize("translate", json!({"x": 1})), json!({"x": 1}));
    }
}
