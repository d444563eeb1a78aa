//! Body parsing, error-message extraction and metadata helpers

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

/// Response headers passed through to the envelope metadata
const HEADER_ALLOW_LIST: &[&str] = &[
    "cache-control",
    "content-encoding",
    "content-language",
    "content-length",
    "content-type",
    "date",
    "etag",
    "last-modified",
    "retry-after",
    "x-request-id",
];

const HEADER_ALLOW_PREFIXES: &[&str] = &["x-ratelimit-"];

/// Turn a raw body into structured data.
///
/// Objects and arrays pass through. Strings are parsed as JSON when possible,
/// otherwise wrapped as `{content, type: "text"}`. Other primitives are
/// wrapped the same way with their JSON type name.
pub fn parse_body(body: Value) -> Value {
    match body {
        Value::Object(_) | Value::Array(_) => body,
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
            _ => json!({ "content": text, "type": "text" }),
        },
        Value::Null => Value::Object(Map::new()),
        Value::Bool(_) => json!({ "content": body, "type": "boolean" }),
        Value::Number(_) => json!({ "content": body, "type": "number" }),
    }
}

/// Best human-readable error message from an error response.
///
/// Preference: non-empty string body, `message`, `error` (string or
/// `{message}`), then the HTTP status text.
pub fn extract_error_message(body: &Value, status_text: &str) -> String {
    let structured;
    let body = match body {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ Value::Object(_)) => {
                structured = parsed;
                &structured
            }
            _ if !text.trim().is_empty() => return text.trim().to_string(),
            _ => return status_text.to_string(),
        },
        other => other,
    };

    if let Some(message) = non_empty_str(body.get("message")) {
        return message.to_string();
    }
    match body.get("error") {
        Some(Value::String(error)) if !error.trim().is_empty() => return error.trim().to_string(),
        Some(error @ Value::Object(_)) => {
            if let Some(message) = non_empty_str(error.get("message")) {
                return message.to_string();
            }
        }
        _ => {}
    }
    status_text.to_string()
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Keep only allow-listed headers. Names are expected lower-case.
pub fn filter_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| {
            HEADER_ALLOW_LIST.contains(&name.as_str())
                || HEADER_ALLOW_PREFIXES.iter().any(|p| name.starts_with(p))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Payload size: `Content-Length` when present, else the bytes read, else the
/// serialized body length
pub fn response_size(headers: &BTreeMap<String, String>, bytes_read: u64, body: &Value) -> u64 {
    if let Some(length) = headers.get("content-length").and_then(|v| v.trim().parse::<u64>().ok()) {
        return length;
    }
    if bytes_read > 0 {
        return bytes_read;
    }
    match body {
        Value::Null => 0,
        Value::String(text) => text.len() as u64,
        other => serde_json::to_vec(other).map(|v| v.len() as u64).unwrap_or(0),
    }
}
