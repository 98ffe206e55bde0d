use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Startup errors. Any of these stops the process before it serves.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one model route is required")]
    NoModels,

    #[error("malformed model spec '{0}', expected NAME=URL[,URL...]")]
    MalformedModelSpec(String),

    #[error("model '{model}' has no replicas")]
    EmptyReplicas { model: String },

    #[error("model '{model}' is configured more than once")]
    DuplicateModel { model: String },

    #[error("endpoint '{url}' appears more than once in the registry")]
    DuplicateEndpoint { url: String },

    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("configured {actual} endpoints but the deployment expects {expected}")]
    ConfigurationMismatch { expected: usize, actual: usize },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to create HTTP client: {0}")]
    HttpClient(String),
}

/// Errors visible to callers of the router
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("model '{0}' is not served by this router")]
    UnknownModel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("backend {endpoint} unreachable: {reason}")]
    BackendUnreachable { endpoint: String, reason: String },

    #[error("backend {endpoint} timed out")]
    BackendTimeout { endpoint: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RouterError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouterError::UnknownModel(_) => StatusCode::NOT_FOUND,
            RouterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RouterError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            RouterError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RouterError::Config(_) | RouterError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            RouterError::UnknownModel(_) | RouterError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            RouterError::BackendUnreachable { .. } | RouterError::BackendTimeout { .. } => {
                "upstream_error"
            }
            RouterError::Config(_) | RouterError::Io(_) => "server_error",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RouterError::UnknownModel(_) => "model_not_found",
            RouterError::InvalidRequest(_) => "invalid_request",
            RouterError::BackendUnreachable { .. } => "backend_unreachable",
            RouterError::BackendTimeout { .. } => "backend_timeout",
            RouterError::Config(_) | RouterError::Io(_) => "internal_error",
        }
    }
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Poller-side failures. Logged and retried on the next cycle, never surfaced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollError {
    #[error("metrics fetch failed: {0}")]
    MetricsFetchFailed(String),

    #[error("malformed metrics payload: {0}")]
    MalformedMetricsPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_error_status_codes() {
        assert_eq!(
            RouterError::UnknownModel("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RouterError::InvalidRequest("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RouterError::BackendUnreachable {
                endpoint: "http://a".to_string(),
                reason: "refused".to_string()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RouterError::BackendTimeout {
                endpoint: "http://a".to_string()
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_config_error_wraps_into_router_error() {
        let err: RouterError = ConfigError::NoModels.into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
