//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// Saga engine error.
    #[error(transparent)]
    Saga(SagaError),
    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::SagaNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::InvalidTransition { .. } | SagaError::OptimisticLockConflict { .. } => {
            (StatusCode::CONFLICT, err.user_message())
        }
        _ => {
            tracing::error!(error = %err, kind = err.kind(), "saga request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.user_message())
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

#[cfg(test)]
mod tests {
    use common::SagaId;
    use saga_store::StoreError;

    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (
                ApiError::Saga(SagaError::SagaNotFound(SagaId::new())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Saga(SagaError::InvalidRequest("quantity".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Saga(SagaError::Store(StoreError::Corrupt("bad row".into()))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::BadRequest("nope".into()),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let (_, message) =
            saga_error_to_response(SagaError::Store(StoreError::Corrupt("bad row".into())));
        assert!(!message.contains("bad row"));
    }
}
