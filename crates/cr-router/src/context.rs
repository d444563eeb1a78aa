use std::collections::BTreeMap;

use cr_common::{new_request_id, EndpointConfig};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_COMMAND_TYPE: &str = "x-command-type";
pub const HEADER_ENVIRONMENT: &str = "x-environment";

/// Header names the router owns; endpoint and caller entries with these names are dropped
const RESERVED_HEADERS: [&str; 4] = [HEADER_REQUEST_ID, HEADER_COMMAND_TYPE, HEADER_ENVIRONMENT, "content-type"];

/// Per-call state, created on entry to `route_command` and dropped with the result
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub command_type: String,
    pub environment: String,
    pub started: Instant,
    pub payload: Value,
    /// Endpoint headers, then caller headers, then tracing headers. Names are lower-case.
    pub headers: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(
        endpoint: &EndpointConfig,
        environment: &str,
        payload: Value,
        caller_headers: &BTreeMap<String, String>,
    ) -> Self {
        Self::with_request_id(new_request_id(), endpoint, environment, payload, caller_headers)
    }

    pub fn with_request_id(
        request_id: String,
        endpoint: &EndpointConfig,
        environment: &str,
        payload: Value,
        caller_headers: &BTreeMap<String, String>,
    ) -> Self {
        let mut headers: BTreeMap<String, String> = endpoint
            .headers
            .iter()
            .chain(caller_headers.iter())
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .filter(|(name, _)| !RESERVED_HEADERS.contains(&name.as_str()))
            .filter(|(name, value)| {
                let valid = HeaderName::from_bytes(name.as_bytes()).is_ok() && HeaderValue::from_str(value).is_ok();
                if !valid {
                    warn!(command_type = %endpoint.command_type, header = %name, "Dropping unusable header");
                }
                valid
            })
            .collect();
        headers.insert(HEADER_REQUEST_ID.to_string(), request_id.clone());
        headers.insert(HEADER_COMMAND_TYPE.to_string(), endpoint.command_type.clone());
        headers.insert(HEADER_ENVIRONMENT.to_string(), environment.to_string());

        Self {
            request_id,
            command_type: endpoint.command_type.clone(),
            environment: environment.to_string(),
            started: Instant::now(),
            payload,
            headers,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
