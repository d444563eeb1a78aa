//! ResponseTransformer - uniform envelopes from raw downstream responses
//!
//! - `normalizer`: per-command-type field mapping registry
//! - `validator`: non-fatal structural warnings
//! - `utils`: body parsing, error message extraction, header/size metadata

pub mod normalizer;
pub mod utils;
pub mod validator;

use cr_common::{ErrorType, ResponseMetadata, RoutingErrorDetail, RoutingResult};
use serde_json::json;

use crate::context::RequestContext;
use crate::executor::{ExecutorError, HttpResponse};

pub use normalizer::{NormalizerRegistry, ResponseNormalizer, ScrapeNormalizer, SearchNormalizer};
pub use validator::{FieldKind, ResponseValidator};

#[derive(Clone, Default)]
pub struct ResponseTransformer {
    normalizers: NormalizerRegistry,
    validator: ResponseValidator,
}

impl ResponseTransformer {
    pub fn new(normalizers: NormalizerRegistry, validator: ResponseValidator) -> Self {
        Self { normalizers, validator }
    }

    /// Built-in normalizers and validation rules
    pub fn standard() -> Self {
        Self::new(NormalizerRegistry::with_builtins(), ResponseValidator::default())
    }

    pub fn normalizers_mut(&mut self) -> &mut NormalizerRegistry {
        &mut self.normalizers
    }

    pub fn validator_mut(&mut self) -> &mut ResponseValidator {
        &mut self.validator
    }

    /// Envelope for a response the downstream actually produced
    pub fn transform(&self, response: HttpResponse, ctx: &RequestContext, attempts: u32) -> RoutingResult {
        let metadata = ResponseMetadata {
            headers: utils::filter_headers(&response.headers),
            content_type: response.content_type().map(str::to_string),
            size_bytes: utils::response_size(&response.headers, response.size_bytes, &response.body),
        };

        if response.status >= 400 {
            let message = utils::extract_error_message(&response.body, &response.status_text);
            let error = RoutingErrorDetail {
                code: format!("HTTP_{}", response.status),
                message,
                error_type: ErrorType::from_status(response.status),
                details: Some(json!({
                    "statusText": response.status_text,
                    "attempts": attempts,
                    "body": response.body,
                })),
            };
            return RoutingResult::failed(&ctx.command_type, &ctx.request_id, response.status, ctx.elapsed_ms(), error)
                .with_metadata(metadata);
        }

        let data = utils::parse_body(response.body);
        let data = self.normalizers.normalize(&ctx.command_type, data);
        let warnings = self.validator.validate(&ctx.command_type, &data);

        RoutingResult::succeeded(
            &ctx.command_type,
            &ctx.request_id,
            response.status,
            ctx.elapsed_ms(),
            data,
            metadata,
        )
        .with_warnings(warnings)
    }

    /// Envelope for a delivery that never produced a usable response
    pub fn transform_failure(&self, err: ExecutorError, ctx: &RequestContext) -> RoutingResult {
        let (status, code, error_type, attempts) = match err {
            ExecutorError::ServerError { response, attempts } => return self.transform(response, ctx, attempts),
            ExecutorError::Network { attempts, .. } => (502, "NETWORK_ERROR", ErrorType::NetworkError, attempts),
            ExecutorError::Timeout { attempts, .. } => (504, "TIMEOUT", ErrorType::TimeoutError, attempts),
            ExecutorError::InvalidRequest(_) => (500, "REQUEST_BUILD_FAILED", ErrorType::ServerError, 1),
        };

        let error = RoutingErrorDetail {
            code: code.to_string(),
            message: err.to_string(),
            error_type,
            details: Some(json!({ "attempts": attempts })),
        };
        RoutingResult::failed(&ctx.command_type, &ctx.request_id, status, ctx.elapsed_ms(), error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_common::EndpointConfig;
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn ctx(command_type: &str) -> RequestContext {
        let endpoint = EndpointConfig::new(command_type, "http://svc.internal/run");
        RequestContext::new(&endpoint, "test", json!({}), &BTreeMap::new())
    }

    fn response(status: u16, body: Value) -> HttpResponse {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        headers.insert("set-cookie".to_string(), "session".to_string());
        HttpResponse {
            status,
            status_text: "Status".to_string(),
            headers,
            body,
            size_bytes: 0,
        }
    }

    #[test]
    fn test_happy_path_scrape() {
        let transformer = ResponseTransformer::standard();
        let result = transformer.transform(response(200, json!({"content": "hello"})), &ctx("scrape"), 1);

        assert!(result.success);
        assert!(!result.fallback);
        assert_eq!(result.http_status, 200);
        assert_eq!(result.data.as_ref().unwrap()["content"], "hello");
        assert!(result.warnings.is_empty());

        let metadata = result.metadata.unwrap();
        assert_eq!(metadata.content_type.as_deref(), Some("application/json"));
        assert!(!metadata.headers.contains_key("set-cookie"));
        assert!(metadata.size_bytes > 0);
    }

    #[test]
    fn test_object_body_round_trips() {
        let transformer = ResponseTransformer::standard();
        let body = json!({"nested": {"list": [1, 2, 3]}, "flag": true});
        let result = transformer.transform(response(200, body.clone()), &ctx("translate"), 1);
        assert_eq!(result.data, Some(body));
    }

    #[test]
    fn test_text_body_wrapped() {
        let transformer = ResponseTransformer::standard();
        let result = transformer.transform(response(200, json!("just text")), &ctx("translate"), 1);
        assert_eq!(result.data, Some(json!({"content": "just text", "type": "text"})));
    }

    #[test]
    fn test_warning_does_not_fail_result() {
        let transformer = ResponseTransformer::standard();
        let result = transformer.transform(response(200, json!({"title": "no content"})), &ctx("scrape"), 1);
        assert!(result.success);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_error_statuses_categorized() {
        let transformer = ResponseTransformer::standard();
        let client = transformer.transform(response(422, json!({"message": "invalid url"})), &ctx("scrape"), 1);
        assert!(!client.success);
        assert!(!client.fallback);
        assert_eq!(client.error_type(), Some(ErrorType::ClientError));
        assert_eq!(client.error.as_ref().unwrap().message, "invalid url");
        assert_eq!(client.error.as_ref().unwrap().code, "HTTP_422");

        let server = transformer.transform(response(500, Value::Null), &ctx("scrape"), 3);
        assert_eq!(server.error_type(), Some(ErrorType::ServerError));
        assert_eq!(server.error.as_ref().unwrap().message, "Status");
    }

    #[test]
    fn test_transport_failures() {
        let transformer = ResponseTransformer::standard();
        let network = transformer.transform_failure(
            ExecutorError::Network { message: "connection refused".to_string(), attempts: 3 },
            &ctx("scrape"),
        );
        assert_eq!(network.http_status, 502);
        assert_eq!(network.error_type(), Some(ErrorType::NetworkError));

        let timeout = transformer.transform_failure(
            ExecutorError::Timeout { timeout_ms: 1000, attempts: 1 },
            &ctx("scrape"),
        );
        assert_eq!(timeout.http_status, 504);
        assert_eq!(timeout.error_type(), Some(ErrorType::TimeoutError));

        let exhausted = transformer.transform_failure(
            ExecutorError::ServerError { response: response(503, json!("down")), attempts: 3 },
            &ctx("scrape"),
        );
        assert_eq!(exhausted.http_status, 503);
        assert_eq!(exhausted.error.unwrap().message, "down");
    }
}
