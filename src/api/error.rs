use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::fund::{ErrorKind, FundError};

/// Everything a handler can fail with, rendered as
/// `{"error": {"kind", "message", "retryable"}}`.
#[derive(Debug)]
pub enum ApiError {
    Fund(FundError),
    /// Malformed path, query or body; never reaches the fund core.
    BadRequest(String),
}

impl From<FundError> for ApiError {
    fn from(err: FundError) -> Self {
        ApiError::Fund(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Fund(err) => err.kind(),
            ApiError::BadRequest(_) => ErrorKind::ValidationError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidStageTransition
            | ErrorKind::InvalidStage
            | ErrorKind::InsufficientShares
            | ErrorKind::InsufficientBalance => StatusCode::CONFLICT,
            ErrorKind::AdapterUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let (message, retryable) = match &self {
            ApiError::Fund(err) if kind == ErrorKind::Internal => {
                tracing::error!("Fund storage error: {}", err);
                ("Internal server error".to_string(), false)
            }
            ApiError::Fund(err) => (err.to_string(), err.is_retryable()),
            ApiError::BadRequest(msg) => (msg.clone(), false),
        };

        let body = Json(json!({
            "error": {
                "kind": kind,
                "message": message,
                "retryable": retryable,
            }
        }));

        (status, body).into_response()
    }
}
