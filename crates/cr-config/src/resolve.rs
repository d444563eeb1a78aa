//! Turns a merged [`EndpointSpec`] into a validated [`EndpointConfig`].

use cr_common::{
    EndpointConfig, HttpMethod, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_TIMEOUT_MS,
    MAX_PRIORITY, MAX_RETRIES_LIMIT, MAX_TIMEOUT_MS, MIN_PRIORITY, MIN_TIMEOUT_MS,
};
use http::header::{HeaderName, HeaderValue};
use url::Url;

use crate::model::EndpointSpec;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEndpoint {
    pub config: EndpointConfig,
    /// Values that were out of range and got clamped
    pub warnings: Vec<String>,
}

/// Resolve a merged spec, filling defaults and clamping numeric ranges.
///
/// Returns `Err(reason)` when the endpoint cannot be used at all
/// (missing/malformed URL, unknown method, unusable header).
pub fn resolve_endpoint(command_type: &str, spec: &EndpointSpec) -> Result<ResolvedEndpoint, String> {
    let url = spec
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| "url is required".to_string())?;
    validate_http_url(url)?;

    if let Some(health_url) = spec.health_url.as_deref() {
        validate_http_url(health_url).map_err(|e| format!("health_url: {e}"))?;
    }

    let method = match spec.method.as_deref() {
        Some(raw) => raw.parse::<HttpMethod>().map_err(|e| e.to_string())?,
        None => HttpMethod::default(),
    };

    for (name, value) in &spec.headers {
        validate_header(name, value)?;
    }

    let mut warnings = Vec::new();

    let timeout_ms = clamp(
        "timeout_ms",
        spec.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
        MIN_TIMEOUT_MS,
        MAX_TIMEOUT_MS,
        &mut warnings,
    );
    let max_retries = clamp(
        "max_retries",
        spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        0,
        MAX_RETRIES_LIMIT,
        &mut warnings,
    );
    let priority = clamp(
        "priority",
        spec.priority.unwrap_or(DEFAULT_PRIORITY),
        MIN_PRIORITY,
        MAX_PRIORITY,
        &mut warnings,
    );

    Ok(ResolvedEndpoint {
        config: EndpointConfig {
            command_type: command_type.to_string(),
            url: url.to_string(),
            method,
            timeout_ms,
            max_retries,
            priority,
            enabled: spec.enabled.unwrap_or(true),
            headers: spec.headers.clone(),
            health_url: spec.health_url.clone(),
        },
        warnings,
    })
}

fn validate_http_url(raw: &str) -> Result<(), String> {
    let parsed = Url::parse(raw).map_err(|e| format!("malformed url '{raw}': {e}"))?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(()),
        "http" | "https" => Err(format!("url '{raw}' has no host")),
        other => Err(format!("url '{raw}' must use http or https, not {other}")),
    }
}

fn validate_header(name: &str, value: &str) -> Result<(), String> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("invalid header name '{name}'"))?;
    HeaderValue::from_str(value).map_err(|_| format!("invalid value for header '{name}'"))?;
    Ok(())
}

fn clamp<T>(field: &str, value: T, min: T, max: T, warnings: &mut Vec<String>) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if clamped != value {
        warnings.push(format!("{field} {value} out of range {min}-{max}, using {clamped}"));
    }
    clamped
}
