//! Shared application state

use std::sync::Arc;
use std::time::Instant;

use leaf_core::ServiceConfig;
use leaf_inference::InferenceService;

/// Shared application state
pub struct AppState {
    /// Inference pipeline
    pub service: InferenceService,
    /// Effective configuration after CLI and environment overrides
    pub config: ServiceConfig,
    /// Server start time
    pub started_at: Instant,
}

impl AppState {
    pub fn new(service: InferenceService, config: ServiceConfig) -> Self {
        Self {
            service,
            config,
            started_at: Instant::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;
