//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// Hostname names no repository, or its backend could not be provisioned or located
    BackendUnavailable,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Proxy is draining and no longer resolves hosts
    ShuttingDown,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::BackendUnavailable, "No backend available for host");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"BACKEND_UNAVAILABLE\""));
        assert!(json.contains("\"message\":\"No backend available for host\""));
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
    fn test_header_value_matches_serialized_code() {
        for code in [
            ProxyErrorCode::MissingHostHeader,
            ProxyErrorCode::BackendUnavailable,
            ProxyErrorCode::ConnectionFailed,
            ProxyErrorCode::ShuttingDown,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_header_value()));
        }
    }
}
