//! Error taxonomy for gateway supervision and the HTTP error bodies served to clients

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Failures of the supervision layer.
///
/// `Clone` so one outcome can be handed to every caller joined on a shared
/// startup or sync future.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// No persisted gateway config yet; the user has to finish setup
    #[error("gateway is not configured")]
    NotConfigured,
    /// Spawned, but never accepted connections within the budget
    #[error("gateway did not become ready within {}s", .0.as_secs())]
    StartupTimeout(Duration),
    /// The child exited before it became ready
    #[error("gateway exited during startup ({0})")]
    ExitedDuringStartup(String),
    /// The gateway refused a connection
    #[error("gateway connection refused")]
    ConnectionRefused,
    /// The OS failed to create the process
    #[error("failed to spawn gateway: {0}")]
    Spawn(String),
    /// An external `config set` call exited non-zero
    #[error("gateway config update failed (exit {code})")]
    ConfigSync { code: i32, output: String },
    /// Shutdown is in progress; no new work is started
    #[error("shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Gateway is starting or recovering
    GatewayUnavailable,
    /// Gateway did not answer within the request timeout
    RequestTimeout,
    /// Forwarding failed for a reason other than a refused connection
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Body used when no fallback page is configured or it cannot be read
pub const FALLBACK_TEXT: &str = "Gateway unavailable. Retrying...";

/// 503 "loading" page shown while the gateway starts or recovers.
///
/// Serves the configured HTML file when readable, plain text otherwise.
pub fn fallback_response(page: Option<&Path>) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (content_type, body) = match page.map(std::fs::read) {
        Some(Ok(html)) => ("text/html; charset=utf-8", Bytes::from(html)),
        _ => ("text/plain; charset=utf-8", Bytes::from_static(FALLBACK_TEXT.as_bytes())),
    };

    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", content_type)
        .header("Cache-Control", "no-store")
        .header("Retry-After", "2")
        .header("X-Proxy-Error", ProxyErrorCode::GatewayUnavailable.as_header_value())
        .body(Full::new(body).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::GatewayUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::InternalError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "Failed to reach gateway");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"Failed to reach gateway\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_fallback_response_without_page() {
        let response = fallback_response(None);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response
            .headers()
            .get("Content-Type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    #[tokio::test]
    async fn test_fallback_response_serves_page() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("loading.html");
        std::fs::write(&page, "<h1>Starting</h1>").unwrap();

        let response = fallback_response(Some(&page));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<h1>Starting</h1>");
    }

    #[test]
    fn test_fallback_response_missing_page_uses_text() {
        let response = fallback_response(Some(Path::new("/nonexistent/loading.html")));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_gateway_error_messages() {
        assert_eq!(
            GatewayError::StartupTimeout(Duration::from_secs(60)).to_string(),
            "gateway did not become ready within 60s"
        );
        assert_eq!(
            GatewayError::ConfigSync { code: 2, output: String::new() }.to_string(),
            "gateway config update failed (exit 2)"
        );
    }
}
