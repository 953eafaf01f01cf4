//! Error kinds and plain-text error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::time::Duration;

/// Error codes attached to proxy responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// Subdomain does not map to any configured project
    ProjectUnknown,
    /// Cold start failed (spawn error, timeout, or port exhaustion)
    ProjectStartFailed,
    /// Running project stopped answering and could not be restarted
    UpstreamUnreachable,
    /// Failed to connect to or forward a request to the dev server
    ConnectionFailed,
    /// Upstream did not produce a response head in time
    RequestTimeout,
}

impl ProxyErrorCode {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ProjectUnknown => StatusCode::NOT_FOUND,
            ProxyErrorCode::ProjectStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::ProjectUnknown => "PROJECT_UNKNOWN",
            ProxyErrorCode::ProjectStartFailed => "PROJECT_START_FAILED",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

/// Build a plain-text error response with an X-Proxy-Error header
pub fn text_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body: String = message.into();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Why a cold start failed.
///
/// Callers match on the kind to pick a response; the Display impl is what
/// ends up in the 503 body and the log line.
#[derive(Debug)]
pub enum StartError {
    /// Every port in the configured range is taken
    NoPortsAvailable { min: u16, max: u16 },
    /// The OS could not launch the start command, or the child died before
    /// answering a health probe
    SpawnFailed(String),
    /// The health probe never succeeded within the startup timeout
    StartTimeout(Duration),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::NoPortsAvailable { min, max } => {
                write!(f, "no free ports in range {}-{}", min, max)
            }
            StartError::SpawnFailed(reason) => write!(f, "failed to start: {}", reason),
            StartError::StartTimeout(timeout) => {
                write!(f, "not healthy after {}ms", timeout.as_millis())
            }
        }
    }
}

impl std::error::Error for StartError {}

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
            ProxyErrorCode::ProjectUnknown.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::ProjectStartFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_text_error_response() {
        let response = text_error_response(ProxyErrorCode::ProjectUnknown, "Project not found");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "PROJECT_UNKNOWN"
        );
    }

    #[test]
    fn test_start_error_display() {
        let err = StartError::NoPortsAvailable { min: 4000, max: 4999 };
        assert_eq!(err.to_string(), "no free ports in range 4000-4999");

        let err = StartError::StartTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "not healthy after 30000ms");

        let err = StartError::SpawnFailed("No such file or directory".to_string());
        assert!(err.to_string().contains("No such file or directory"));
    }
}
