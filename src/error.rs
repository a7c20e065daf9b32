//! # Error Handling
//!
//! The HTTP-surface error taxonomy and how it renders as a JSON response.
//!
//! ## Error Categories:
//! - **ConfigError**: Configuration problems surfaced at startup (500 errors)
//! - **ServiceUnavailable**: The call bridge is at capacity (503 errors)
//!
//! Failures inside a live call session do not flow through this type: transport
//! failures tear the session down directly, and malformed frames are dropped at
//! the point of decoding (see the transcoder's own error type).

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP surface of the application.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::ServiceUnavailable("Maximum concurrent calls reached".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Configuration file or environment variable problems
    ConfigError(String),

    /// The maximum number of concurrent calls has been reached
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts our custom errors into HTTP responses that clients can understand.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum concurrent calls reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
            ),
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

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn test_service_unavailable_envelope() {
        let response =
            AppError::ServiceUnavailable("Maximum concurrent calls reached".to_string())
                .error_response();
        assert_eq!(
            response.status(),
            actix_web::http::StatusCode::SERVICE_UNAVAILABLE
        );

        let body = actix_web::body::to_bytes(response.into_body())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "service_unavailable");
        assert_eq!(json["error"]["message"], "Maximum concurrent calls reached");
        assert!(json["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_config_error_maps_to_500() {
        let response = AppError::ConfigError("bad port".to_string()).error_response();
        assert_eq!(response.status().as_u16(), 500);
    }

    #[test]
    fn test_config_error_conversion() {
        let err = config::ConfigError::Message("missing field".to_string());
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));
        assert!(app_err.to_string().contains("missing field"));
    }
}
