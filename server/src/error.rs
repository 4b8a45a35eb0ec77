//! HTTP error responses.
//!
//! Every failure leaves the server as `{"error": <message>}` with one of a
//! fixed set of messages. Causes are logged, never sent to the client.

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use leaf_inference::{ImageError, ServiceError};
use serde_json::json;
use tracing::warn;

pub const NO_FILE_UPLOADED: &str = "no file uploaded";
pub const INVALID_MULTIPART: &str = "invalid multipart form";
pub const NO_FILE_SELECTED: &str = "no file selected";
pub const EMPTY_FILE: &str = "empty file";
pub const UNSUPPORTED_FILE_TYPE: &str = "unsupported file type";
pub const FILE_TOO_LARGE: &str = "file too large";
pub const UNSUPPORTED_IMAGE: &str = "unsupported image format";
pub const MODEL_UNAVAILABLE: &str = "model unavailable";
pub const INTERNAL_ERROR: &str = "internal server error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: &'static str,
}

impl ApiError {
    pub fn bad_request(message: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    pub fn too_large() -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: FILE_TOO_LARGE,
        }
    }

    pub fn model_unavailable() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: MODEL_UNAVAILABLE,
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: INTERNAL_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        // The service has already logged the cause
        match err {
            ServiceError::InvalidInput(ImageError::Empty) => Self::bad_request(EMPTY_FILE),
            ServiceError::InvalidInput(ImageError::TooLarge { .. }) => Self::too_large(),
            ServiceError::InvalidInput(ImageError::UnsupportedFormat(_)) => {
                Self::bad_request(UNSUPPORTED_IMAGE)
            }
            ServiceError::ModelUnavailable(_) => Self::model_unavailable(),
            ServiceError::InternalError(_) => Self::internal(),
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(err: MultipartRejection) -> Self {
        warn!("Rejected form: {err}");
        Self::bad_request(INVALID_MULTIPART)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        warn!("Rejected form: {err}");
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::too_large()
        } else {
            Self::bad_request(INVALID_MULTIPART)
        }
    }
}
