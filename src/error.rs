//! # Error Handling
//!
//! Two error families live here:
//! - [`AppError`]: HTTP-facing errors, turned into JSON responses by actix
//! - [`StreamError`]: the streaming taxonomy used inside voice sessions
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of failure
//! - **Pattern matching**: `match` decides status codes and session outcomes
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert library errors automatically
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **thiserror**: Derives `Display` and `std::error::Error` for [`StreamError`]
//!
//! ## Streaming taxonomy:
//! | Variant            | Meaning                                      | Session outcome        |
//! |--------------------|----------------------------------------------|------------------------|
//! | `Configuration`    | Engine unusable or assets missing at startup | No session can start   |
//! | `TransientSegment` | One segment's synthesis/conversion failed    | Segment dropped        |
//! | `Protocol`         | Malformed or out-of-sequence peer message    | Error signal, continue |
//! | `FatalSession`     | Conversion engine unusable mid-session       | Error signal, end      |

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;                          // Derive macro for StreamError

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: Capacity exhausted or engine down (503 errors)
/// - **Upstream**: The synthesis service or conversion engine failed (502 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The service cannot take this request right now
    Unavailable(String),

    /// A collaborator service returned an error
    Upstream(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream error: {}", msg),
        }
    }
}

/// Converts [`AppError`] into an HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "session limit reached (10)",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        use actix_web::http::StatusCode;

        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            AppError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", msg),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<StreamError> for AppError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Configuration(msg) => AppError::ConfigError(msg),
            StreamError::TransientSegment(msg) => AppError::Upstream(msg),
            StreamError::Protocol(msg) => AppError::BadRequest(msg),
            StreamError::FatalSession(msg) => AppError::Unavailable(msg),
        }
    }
}

/// Failures inside a streaming voice session.
///
/// ## Rust Concepts:
/// - **#[derive(Error)]**: `thiserror` generates `Display` from the `#[error]` strings
/// - **Classification methods**: the session loop branches on these instead of unwinding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The conversion engine or a required asset is unusable
    #[error("configuration error: {0}")]
    Configuration(String),

    /// One segment could not be rendered; the session carries on
    #[error("segment dropped: {0}")]
    TransientSegment(String),

    /// The peer sent something the session cannot act on
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session cannot continue
    #[error("session terminated: {0}")]
    FatalSession(String),
}

impl StreamError {
    /// Whether this error ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::Configuration(_) | StreamError::FatalSession(_))
    }

    /// Text sent to the peer in the `error` event.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (AppError::ConfigError("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.error_response().status(), status);
        }
    }

    #[test]
    fn test_stream_error_classification() {
        assert!(StreamError::FatalSession("down".into()).is_terminal());
        assert!(StreamError::Configuration("missing".into()).is_terminal());
        assert!(!StreamError::TransientSegment("timeout".into()).is_terminal());
        assert!(!StreamError::Protocol("bad json".into()).is_terminal());
        assert_eq!(
            StreamError::Protocol("bad json".into()).detail(),
            "protocol error: bad json"
        );
    }

    #[test]
    fn test_stream_error_maps_to_http() {
        let error: AppError = StreamError::FatalSession("engine down".into()).into();
        assert!(matches!(error, AppError::Unavailable(_)));
    }
}
