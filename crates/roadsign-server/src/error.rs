use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Request-scoped failures, rendered as `{"error": "..."}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("No file part")]
    NoFilePart,

    #[error("No selected file")]
    NoSelectedFile,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    UnprocessableImage(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NoFilePart | ApiError::NoSelectedFile | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::UnprocessableImage(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<roadsign::Error> for ApiError {
    fn from(err: roadsign::Error) -> Self {
        match err {
            roadsign::Error::Image(err) => ApiError::UnprocessableImage(err.to_string()),
            err => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Prediction failed: {self}");
        } else {
            log::warn!("Rejected request: {self}");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
