//! Image classification endpoint

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::error::{
    ApiError, EMPTY_FILE, NO_FILE_SELECTED, NO_FILE_UPLOADED, UNSUPPORTED_FILE_TYPE,
};
use crate::state::SharedState;

/// Form field carrying the image
pub const FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub prediction: String,
    pub confidence: f32,
}

/// POST /predict - Classify an uploaded leaf image
pub async fn predict(
    State(state): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let mut multipart = multipart?;

    let (filename, bytes) = loop {
        let Some(field) = multipart.next_field().await? else {
            return Err(ApiError::bad_request(NO_FILE_UPLOADED));
        };
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if filename.is_empty() {
            return Err(ApiError::bad_request(NO_FILE_SELECTED));
        }
        if !state.config.upload.is_allowed_filename(&filename) {
            warn!(filename = %filename, "Rejected upload with disallowed extension");
            return Err(ApiError::bad_request(UNSUPPORTED_FILE_TYPE));
        }
        break (filename, field.bytes().await?);
    };

    if bytes.is_empty() {
        warn!(filename = %filename, "Rejected empty upload");
        return Err(ApiError::bad_request(EMPTY_FILE));
    }

    let result = state.service.classify(bytes.to_vec()).await?;
    Ok(Json(PredictResponse {
        prediction: result.display_name,
        confidence: result.reported_confidence,
    }))
}
