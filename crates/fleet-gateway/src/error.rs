use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleet_core::FleetError;
use thiserror::Error;

/// Errors returned by gateway handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected by the orchestrator.
    #[error(transparent)]
    Fleet(#[from] FleetError),

    /// The body could not be decoded.
    #[error("invalid request body: {0}")]
    BadRequest(String),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Fleet(e) => match e {
                FleetError::Validation(_) | FleetError::Config(_) | FleetError::Json(_) => {
                    StatusCode::BAD_REQUEST
                }
                FleetError::Protocol(_) => StatusCode::UNPROCESSABLE_ENTITY,
                FleetError::NotFound(_) => StatusCode::NOT_FOUND,
                FleetError::Agent(_) => StatusCode::CONFLICT,
                FleetError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
                FleetError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                FleetError::Transport(_) | FleetError::TaskExecution(_) => StatusCode::BAD_GATEWAY,
                FleetError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = match &self {
            ApiError::Fleet(e) => e.kind().to_string(),
            ApiError::BadRequest(_) => "validation".to_string(),
        };
        let body = serde_json::json!({
            "error": self.to_string(),
            "kind": kind,
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let not_found = ApiError::from(FleetError::NotFound("agent 'x'".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid = ApiError::from(FleetError::Validation("empty id".into()));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let garbled = ApiError::from(FleetError::Protocol("no STATUS line".into()));
        assert_eq!(garbled.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_body_carries_kind() {
        let resp = ApiError::from(FleetError::Resource("no agents".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
