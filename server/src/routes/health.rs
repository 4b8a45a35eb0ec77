//! Health check endpoint

use axum::{extract::State, Json};
use leaf_inference::ModelStatus;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` once the model has failed
    pub status: String,
    pub uptime_seconds: u64,
    pub version: String,
    pub model: ModelStatus,
    pub taxonomy_version: String,
    pub classes: usize,
    pub load_attempts: usize,
}

/// GET /health - Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthResponse> {
    let model = state.service.model().status();
    let status = match model {
        ModelStatus::Failed { .. } => "degraded",
        _ => "ok",
    };

    Json(HealthResponse {
        status: status.to_string(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model,
        taxonomy_version: state.service.registry().version().to_string(),
        classes: state.service.registry().len(),
        load_attempts: state.service.model().load_attempts(),
    })
}
