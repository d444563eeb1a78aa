//! Structural checks on successful responses. Findings are warnings only.

use std::collections::HashMap;

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Non-empty string
    Text,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.as_str().map(|s| !s.trim().is_empty()).unwrap_or(false),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => !value.is_null(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldKind::Text => "a non-empty string",
            FieldKind::Array => "an array",
            FieldKind::Object => "an object",
            FieldKind::Any => "present",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseValidator {
    expectations: HashMap<String, Vec<(String, FieldKind)>>,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        let mut validator = Self {
            expectations: HashMap::new(),
        };
        validator.expect("scrape", "content", FieldKind::Text);
        validator.expect("search", "results", FieldKind::Array);
        validator
    }
}

impl ResponseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` of the given kind in `command_type` responses
    pub fn expect(&mut self, command_type: impl Into<String>, field: impl Into<String>, kind: FieldKind) {
        self.expectations
            .entry(command_type.into())
            .or_default()
            .push((field.into(), kind));
    }

    pub fn validate(&self, command_type: &str, data: &Value) -> Vec<String> {
        let mut warnings = Vec::new();

        match data {
            Value::Object(obj) if obj.is_empty() => warnings.push("Response body is empty".to_string()),
            Value::Object(obj) => {
                if obj.get("success") == Some(&Value::Bool(false)) || obj.get("error").map_or(false, |e| !e.is_null()) {
                    warnings.push("Response reports an error despite a success status".to_string());
                }
            }
            _ => {}
        }

        for (field, kind) in self.expectations.get(command_type).into_iter().flatten() {
            match data.get(field.as_str()) {
                None => warnings.push(format!("Expected {field} field missing")),
                Some(value) if !kind.matches(value) => {
                    warnings.push(format!("Expected {field} field to be {}", kind.describe()))
                }
                Some(_) => {}
            }
        }

        warnings
    }
}
