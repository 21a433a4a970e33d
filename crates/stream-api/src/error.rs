use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use stream_orchestrator::PodManagerError;
use stream_store::RepositoryError;

/// The closed error-code set: every failure surfaced to an API client
/// carries exactly one of these codes, never a raw `Display` string.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    DuplicateMonitor(String),
    MaxMonitorsExceeded,
    ValidationError(String),
    InvalidUrl(String),
    InvalidConfig(String),
    RateLimitExceeded,
    MonitorNotActive(String),
    Internal(String),
    Database(String),
    Kubernetes(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", m.clone()),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing or invalid API key".into()),
            Self::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", "not permitted".into()),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, "NOT_FOUND", m.clone()),
            Self::DuplicateMonitor(m) => (StatusCode::CONFLICT, "DUPLICATE_MONITOR", m.clone()),
            Self::MaxMonitorsExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "MAX_MONITORS_EXCEEDED",
                "active monitor limit reached".into(),
            ),
            Self::ValidationError(m) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", m.clone()),
            Self::InvalidUrl(m) => (StatusCode::BAD_REQUEST, "INVALID_URL", m.clone()),
            Self::InvalidConfig(m) => (StatusCode::BAD_REQUEST, "INVALID_CONFIG", m.clone()),
            Self::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                "too many requests".into(),
            ),
            Self::MonitorNotActive(m) => (StatusCode::CONFLICT, "MONITOR_NOT_ACTIVE", m.clone()),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", m.clone()),
            Self::Database(m) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", m.clone()),
            Self::Kubernetes(m) => (StatusCode::INTERNAL_SERVER_ERROR, "KUBERNETES_ERROR", m.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, axum::Json(ErrorBody { error: ErrorDetail { code, message } })).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound(id) => Self::NotFound(format!("monitor {id} not found")),
            RepositoryError::DuplicateActiveMonitor(url) => {
                Self::DuplicateMonitor(format!("an active monitor already exists for {url}"))
            }
            RepositoryError::NotActive(id) => Self::MonitorNotActive(format!("monitor {id} is not active")),
            RepositoryError::StatsNotFound(id) => Self::Database(format!("stats missing for monitor {id}")),
            RepositoryError::Backend(e) => Self::Database(e.to_string()),
        }
    }
}

impl From<PodManagerError> for ApiError {
    fn from(e: PodManagerError) -> Self {
        Self::Kubernetes(e.to_string())
    }
}
