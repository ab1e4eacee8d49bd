use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider '{provider}' timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    #[error("Provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Upstream error: {status} - {message}")]
    Upstream { status: u16, message: String },

    #[error("Circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("All providers exhausted")]
    AllProvidersExhausted,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header error: {0}")]
    Header(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DispatchError::ProviderTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Provider { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            DispatchError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            DispatchError::AllProvidersExhausted => StatusCode::SERVICE_UNAVAILABLE,
            // nginx's "client closed request"
            DispatchError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::Http(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Json(_) => StatusCode::BAD_REQUEST,
            DispatchError::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchError::Header(_) => StatusCode::BAD_REQUEST,
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            DispatchError::Config(_) => "configuration_error",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::ProviderTimeout { .. } => "provider_timeout",
            DispatchError::Provider { .. } => "provider_error",
            DispatchError::Upstream { .. } => "upstream_error",
            DispatchError::CircuitOpen(_) => "circuit_open",
            DispatchError::UnknownProvider(_) => "unknown_provider",
            DispatchError::AllProvidersExhausted => "all_providers_exhausted",
            DispatchError::Cancelled => "cancelled",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Http(_) => "http_error",
            DispatchError::Json(_) => "json_error",
            DispatchError::Yaml(_) => "yaml_error",
            DispatchError::Io(_) => "io_error",
            DispatchError::Header(_) => "header_error",
            DispatchError::Internal(_) => "internal_error",
        }
    }

    /// Whether another attempt against the same provider could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::ProviderTimeout { .. } => true,
            DispatchError::Provider { .. } => true,
            DispatchError::Upstream { status, .. } => {
                // Retry on common transient errors
                matches!(
                    *status,
                    429 | // Too Many Requests
                    500 | // Internal Server Error
                    502 | // Bad Gateway
                    503 | // Service Unavailable
                    504   // Gateway Timeout
                )
            }
            DispatchError::Http(e) => {
                // Retry on network errors, timeouts, etc.
                e.is_timeout() || e.is_connect() || e.is_request()
            }
            DispatchError::Json(_) => true,
            _ => false,
        }
    }
}

// Implement IntoResponse for DispatchError to convert errors into HTTP responses
impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type().to_string();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                error_type = %error_type,
                status = status.as_u16(),
                message = %message,
                "Request failed"
            );
        } else {
            tracing::warn!(
                error_type = %error_type,
                status = status.as_u16(),
                message = %message,
                "Request rejected"
            );
        }

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "code": status.as_u16(),
            }
        }));

        let mut response = (status, body).into_response();
        if let DispatchError::RateLimited { retry_after_ms } = self {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(DispatchError::ProviderTimeout {
            provider: "primary".to_string(),
            timeout_ms: 10_000
        }
        .is_retryable());
        assert!(DispatchError::Provider {
            provider: "primary".to_string(),
            message: "connection reset".to_string()
        }
        .is_retryable());
        for status in [429, 500, 502, 503, 504] {
            assert!(DispatchError::Upstream {
                status,
                message: "transient".to_string()
            }
            .is_retryable());
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(!DispatchError::InvalidRequest("bad".to_string()).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::Upstream {
            status: 400,
            message: "Bad request".to_string()
        }
        .is_retryable());
        assert!(!DispatchError::Upstream {
            status: 401,
            message: "Unauthorized".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = DispatchError::RateLimited {
            retry_after_ms: 1500,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DispatchError::Upstream {
                status: 503,
                message: String::new()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            DispatchError::Config("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(DispatchError::Cancelled.status_code().as_u16(), 499);
        assert_eq!(
            DispatchError::UnknownProvider("nope".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
