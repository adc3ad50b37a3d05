//! Error taxonomy and wire-format mapping
//!
//! Every failure the gateway can surface is a [`GatewayError`]. Rendering
//! depends on which dialect the client speaks: Anthropic clients get
//! `{type:"error", error:{type, message}}`, OpenAI clients get
//! `{error:{message, type, code}}`. Recoverable conditions (first-token
//! retry, tolerated chunk timeouts, 429 backoff) never reach this module;
//! only what must be surfaced does.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde_json::json;

/// Which client dialect a response should be rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAi,
    Anthropic,
}

impl WireFormat {
    pub fn name(&self) -> &'static str {
        match self {
            WireFormat::OpenAi => "openai",
            WireFormat::Anthropic => "anthropic",
        }
    }
}

/// Errors surfaced to clients.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed or oversized input; never retried. 400.
    InvalidRequest(String),
    /// Client key rejected. 401.
    Authentication(String),
    /// Upstream refresh-token rejection passed through. 401.
    UpstreamAuth(String),
    /// No credential can serve this request. 503.
    NoTokenAvailable(String),
    /// Rate limited. 429.
    RateLimited(String),
    /// Upstream returned a non-200 we mirror. Carries its status.
    Upstream { status: u16, message: String },
    /// First-token retries exhausted. 504.
    FirstTokenTimeout,
    /// Anything unexpected; message redacted unless debug mode. 500.
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Authentication(_) | GatewayError::UpstreamAuth(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::NoTokenAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::FirstTokenTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic error type string for this error.
    fn anthropic_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Authentication(_) | GatewayError::UpstreamAuth(_) => {
                "authentication_error"
            }
            GatewayError::NoTokenAvailable(_) => "overloaded_error",
            GatewayError::RateLimited(_) => "rate_limit_error",
            GatewayError::Upstream { .. }
            | GatewayError::FirstTokenTimeout
            | GatewayError::Internal(_) => "api_error",
        }
    }

    fn message(&self, debug_mode: bool) -> String {
        match self {
            GatewayError::InvalidRequest(m)
            | GatewayError::Authentication(m)
            | GatewayError::UpstreamAuth(m)
            | GatewayError::NoTokenAvailable(m)
            | GatewayError::RateLimited(m)
            | GatewayError::Upstream { message: m, .. } => m.clone(),
            GatewayError::FirstTokenTimeout => {
                "Upstream did not start responding in time".to_string()
            }
            GatewayError::Internal(m) => {
                if debug_mode {
                    format!("Internal server error: {}", m)
                } else {
                    "Internal server error".to_string()
                }
            }
        }
    }

    /// Render this error as an HTTP response in the given dialect.
    pub fn into_response_for(self, format: WireFormat, debug_mode: bool) -> Response {
        let status = self.status();
        let message = self.message(debug_mode);

        tracing::error!("HTTP {} - {}", status.as_u16(), message);

        let body = match format {
            WireFormat::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": self.anthropic_type(),
                    "message": message,
                }
            }),
            WireFormat::OpenAi => json!({
                "error": {
                    "message": message,
                    "type": self.anthropic_type(),
                    "code": status.as_u16(),
                }
            }),
        };

        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message(true))
    }
}

impl std::error::Error for GatewayError {}

/// What an upstream error body means for the credential and the client.
#[derive(Debug, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// Monthly quota exhausted; the credential must be marked expired.
    Quota,
    /// Context window / input length exceeded; 400, never retried.
    Input,
    /// Anything else; mirrored as api_error.
    Other,
}

/// Parsed view of an upstream error body.
#[derive(Debug)]
pub struct UpstreamErrorInfo {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

/// Classify an upstream non-200 body.
///
/// Bodies are JSON of the shape `{reason?, message?}` or
/// `{error: {reason?, message?}}`; anything unparseable is used verbatim.
pub fn classify_upstream_error(body: &str) -> UpstreamErrorInfo {
    let mut message = body.to_string();
    let mut reason = String::new();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let obj = value.get("error").unwrap_or(&value);
        if let Some(r) = obj.get("reason").and_then(|v| v.as_str()) {
            reason = r.to_string();
        }
        if let Some(m) = obj.get("message").and_then(|v| v.as_str()) {
            message = m.to_string();
        }
        if !reason.is_empty() {
            message = format!("{} (reason: {})", message, reason);
        }
    }

    let combined = format!("{}{}", reason, message);
    let kind = if combined.contains("MONTHLY_REQUEST_COUNT") {
        UpstreamErrorKind::Quota
    } else if combined.contains("CONTENT_LENGTH_EXCEEDS_THRESHOLD")
        || combined.contains("Input is too long")
    {
        UpstreamErrorKind::Input
    } else {
        UpstreamErrorKind::Other
    };

    UpstreamErrorInfo { kind, message }
}

/// Map a classified upstream error into the client-facing error.
pub fn upstream_error_to_gateway(status: u16, info: &UpstreamErrorInfo) -> GatewayError {
    match info.kind {
        UpstreamErrorKind::Input => GatewayError::InvalidRequest(
            "Input is too long. Reduce conversation history, system prompt, or tools.".to_string(),
        ),
        UpstreamErrorKind::Quota => GatewayError::InvalidRequest(info.message.clone()),
        UpstreamErrorKind::Other => GatewayError::Upstream {
            status,
            message: info.message.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota() {
        let info = classify_upstream_error(
            r#"{"reason":"MONTHLY_REQUEST_COUNT_REACHED","message":"limit hit"}"#,
        );
        assert_eq!(info.kind, UpstreamErrorKind::Quota);
        assert!(info.message.contains("limit hit"));
        assert!(info.message.contains("MONTHLY_REQUEST_COUNT_REACHED"));
    }

    #[test]
    fn test_classify_context_overflow() {
        let info = classify_upstream_error(
            r#"{"reason":"CONTENT_LENGTH_EXCEEDS_THRESHOLD","message":"too big"}"#,
        );
        assert_eq!(info.kind, UpstreamErrorKind::Input);
    }

    #[test]
    fn test_classify_input_too_long_in_message() {
        let info = classify_upstream_error(r#"{"message":"Input is too long."}"#);
        assert_eq!(info.kind, UpstreamErrorKind::Input);
    }

    #[test]
    fn test_classify_nested_error_object() {
        let info =
            classify_upstream_error(r#"{"error":{"message":"boom","reason":"SOMETHING_ELSE"}}"#);
        assert_eq!(info.kind, UpstreamErrorKind::Other);
        assert!(info.message.contains("boom"));
    }

    #[test]
    fn test_classify_unparseable_body() {
        let info = classify_upstream_error("<html>bad gateway</html>");
        assert_eq!(info.kind, UpstreamErrorKind::Other);
        assert_eq!(info.message, "<html>bad gateway</html>");
    }

    #[test]
    fn test_input_error_maps_to_400() {
        let info = classify_upstream_error(r#"{"reason":"CONTENT_LENGTH_EXCEEDS_THRESHOLD"}"#);
        let err = upstream_error_to_gateway(500, &info);
        // 400 regardless of the upstream status
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_internal_redacted_without_debug() {
        let err = GatewayError::Internal("secret detail".to_string());
        assert_eq!(err.message(false), "Internal server error");
        assert!(err.message(true).contains("secret detail"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            GatewayError::FirstTokenTimeout.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::RateLimited(String::new()).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::Upstream { status: 418, message: String::new() }.status().as_u16(),
            418
        );
    }
}
