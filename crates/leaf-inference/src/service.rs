//! Per-request orchestration of preprocessing, prediction and postprocessing.

use std::sync::Arc;
use std::time::Instant;

use leaf_core::{ModelManifest, ServiceConfig, TaxonomyRegistry};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::BurnLoader;
use crate::model::{ModelError, ModelHandle, ModelLoader};
use crate::postprocess::{Postprocessor, PredictionResult};
use crate::preprocess::{ImageError, Preprocessor};

/// Errors returned by [`InferenceService::classify`].
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Model is not ready and could not be loaded
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Empty, oversized or undecodable upload
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ImageError),

    /// Unexpected backend failure
    #[error("internal error: {0}")]
    InternalError(String),
}

impl From<ModelError> for ServiceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Load(_) | ModelError::Failed { .. } => {
                ServiceError::ModelUnavailable(err.to_string())
            }
            ModelError::Predict(_) => ServiceError::InternalError(err.to_string()),
        }
    }
}

/// The inference pipeline. Shared across request handlers.
pub struct InferenceService {
    preprocessor: Arc<Preprocessor>,
    model: ModelHandle,
    postprocessor: Postprocessor,
    registry: Arc<TaxonomyRegistry>,
}

impl InferenceService {
    /// Builds the service with the burn backend.
    ///
    /// Reads and validates the manifest named by the configuration; any
    /// configuration, manifest or taxonomy error is returned before the
    /// service can take traffic. The model itself is not loaded here.
    pub fn from_config(config: &ServiceConfig) -> leaf_core::Result<Self> {
        let manifest = ModelManifest::load(&config.manifest)?;
        Self::with_loader(config, manifest, Arc::new(BurnLoader))
    }

    pub fn with_loader(
        config: &ServiceConfig,
        manifest: ModelManifest,
        loader: Arc<dyn ModelLoader>,
    ) -> leaf_core::Result<Self> {
        let registry = Arc::new(manifest.registry()?);
        info!(
            taxonomy = %registry.version(),
            classes = registry.len(),
            artifact = %manifest.model.path.display(),
            "Taxonomy bound to model manifest"
        );

        let preprocessor = Arc::new(Preprocessor::new(manifest.input, config.upload.max_bytes));
        let postprocessor = Postprocessor::new(
            registry.clone(),
            config.calibration,
            config.labels.unidentified.clone(),
        );

        Ok(Self {
            preprocessor,
            model: ModelHandle::new(manifest, loader),
            postprocessor,
            registry,
        })
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn registry(&self) -> &TaxonomyRegistry {
        &self.registry
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.preprocessor.max_bytes()
    }

    /// Classifies one uploaded image.
    pub async fn classify(&self, bytes: Vec<u8>) -> Result<PredictionResult, ServiceError> {
        let started = Instant::now();

        if let Err(err) = self.preprocessor.check_payload(&bytes) {
            warn!("Rejected upload: {err}");
            return Err(err.into());
        }

        self.model.ensure_ready().await.map_err(|err| {
            error!("Model unavailable: {err}");
            ServiceError::from(err)
        })?;

        let preprocessor = self.preprocessor.clone();
        let tensor = tokio::task::spawn_blocking(move || preprocessor.prepare(&bytes))
            .await
            .map_err(|e| {
                error!("Preprocessing task failed: {e}");
                ServiceError::InternalError(format!("preprocessing task failed: {e}"))
            })?
            .map_err(|err| {
                warn!("Rejected upload: {err}");
                ServiceError::from(err)
            })?;

        let probs = self.model.predict(tensor).await.map_err(|err| {
            error!("Prediction failed: {err}");
            ServiceError::from(err)
        })?;

        let result = self.postprocessor.finalize(&probs);
        info!(
            class_id = %result.class_id,
            raw_confidence = result.raw_confidence,
            reported_confidence = result.reported_confidence,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classified upload"
        );
        Ok(result)
    }
}
