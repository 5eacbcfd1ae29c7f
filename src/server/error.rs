use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::error::{ClassifyError, FeedbackError};

/// API错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;

impl AppError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Classify(ClassifyError::Decode(_)) => (StatusCode::BAD_REQUEST, "DECODE_ERROR"),
            Self::Classify(ClassifyError::Unavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "MODEL_UNAVAILABLE")
            }
            Self::Feedback(FeedbackError::Decode(_)) => (StatusCode::BAD_REQUEST, "DECODE_ERROR"),
            Self::Feedback(FeedbackError::InvalidName(_)) => (StatusCode::BAD_REQUEST, "INVALID_NAME"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": format!("{self:#}"),
            }
        }));
        (status, body).into_response()
    }
}
