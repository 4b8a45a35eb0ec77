//! Model lifecycle endpoints

use axum::{extract::State, Json};
use serde::Serialize;
use tracing::{error, info};

use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Serialize)]
pub struct ReloadResponse {
    pub status: String,
}

/// POST /model/reload - Load the model artifact again
///
/// The only way out of a failed model state.
pub async fn reload_model(
    State(state): State<SharedState>,
) -> Result<Json<ReloadResponse>, ApiError> {
    match state.service.model().reload().await {
        Ok(()) => {
            info!("Model reloaded on request");
            Ok(Json(ReloadResponse {
                status: "ready".to_string(),
            }))
        }
        Err(err) => {
            error!("Model reload failed: {err}");
            Err(ApiError::model_unavailable())
        }
    }
}
