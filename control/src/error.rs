use axum::response::{IntoResponse, Response};
use reqwest::StatusCode;

/// Typed error taxonomy for the control API. Every variant has a fixed
/// HTTP mapping; handlers return `ApiError` and never pick codes ad hoc.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("project is not active: {0}")]
    ProjectNotActive(String),

    #[error("readiness wait timed out: {0}")]
    ReadinessTimeout(String),

    #[error("orchestrator error: {source}")]
    Orchestrator {
        #[from]
        source: kube::Error,
    },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("upstream agent error: {0}")]
    Upstream(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::ProjectNotActive(_) => StatusCode::BAD_REQUEST,
            ApiError::ReadinessTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Orchestrator { .. } => StatusCode::BAD_GATEWAY,
            ApiError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            // 499 Client Closed Request, the nginx convention
            ApiError::Cancelled(_) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn project_not_found(project_id: &str) -> Self {
        ApiError::NotFound(format!("project {} not found", project_id))
    }

    pub fn user_not_found(user_id: &str) -> Self {
        ApiError::NotFound(format!("user {} not found", user_id))
    }

    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        ApiError::StorageUnavailable(e.to_string())
    }

    pub fn upstream<E: std::fmt::Display>(e: E) -> Self {
        ApiError::Upstream(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        aviary_common::response::err_resp(self, code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping_is_exact() {
        assert_eq!(
            ApiError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Conflict("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::InvalidArgument("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ProjectNotActive("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ReadinessTimeout("x".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::StorageUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Upstream("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::Cancelled("x".into()).status_code().as_u16(), 499);
    }
}
