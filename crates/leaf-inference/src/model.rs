//! Model lifecycle.
//!
//! [`ModelHandle`] owns the loaded classifier and its health state:
//!
//! ```text
//! UNLOADED --load ok--> READY
//! UNLOADED --load err--> FAILED
//! READY --unrecoverable backend error--> FAILED
//! READY --reload--> READY (new classifier, or the old one if the reload failed)
//! FAILED --reload--> READY | FAILED
//! ```
//!
//! Loads are single-flight: a transition mutex is held for the whole load, so
//! requests that observe `UNLOADED` at the same time wait for one attempt
//! and share its outcome. Requests on a `READY` model only take a read lock
//! on the state and never touch the transition mutex. `FAILED` is sticky
//! until [`ModelHandle::reload`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use leaf_core::ModelManifest;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::preprocess::PreprocessedTensor;

/// Errors raised while loading a model artifact.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("model artifact not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to read model artifact {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "checksum mismatch for {}: manifest has {expected}, artifact is {actual}",
        path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("failed to deserialize model: {0}")]
    DeserializationFailed(String),

    #[error("model produces {actual} outputs but the manifest declares {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("inference worker error: {0}")]
    Worker(String),
}

/// Errors raised by a single forward pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictError {
    #[error("input shape {actual:?} does not match model input {expected:?}")]
    ShapeMismatch {
        expected: [usize; 4],
        actual: [usize; 4],
    },

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("inference worker stopped")]
    WorkerStopped,
}

impl PredictError {
    /// Whether the classifier can no longer serve requests.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, PredictError::WorkerStopped)
    }
}

/// Errors surfaced by [`ModelHandle`].
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model load failed: {0}")]
    Load(#[from] LoadError),

    #[error("model is in failed state: {reason}")]
    Failed { reason: String },

    #[error("prediction failed: {0}")]
    Predict(#[from] PredictError),
}

/// A loaded classifier. Implementations must tolerate concurrent calls,
/// serializing internally when the backend cannot.
pub trait Classifier: Send + Sync {
    /// Expected input shape `[1, H, W, 3]`
    fn input_shape(&self) -> [usize; 4];

    /// Width of the probability vector
    fn output_width(&self) -> usize;

    /// Runs one forward pass and returns class probabilities.
    fn predict(&self, tensor: PreprocessedTensor) -> Result<Vec<f32>, PredictError>;
}

/// Builds a classifier from a manifest. Called from a blocking context.
pub trait ModelLoader: Send + Sync {
    fn load(&self, manifest: &ModelManifest) -> Result<Arc<dyn Classifier>, LoadError>;
}

/// Observable model state, as reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ModelStatus {
    Unloaded,
    /// A load is in progress
    Loading,
    Ready,
    Failed { reason: String },
}

enum State {
    Unloaded,
    Ready(Arc<dyn Classifier>),
    Failed(String),
}

/// Clears the loading flag when a load ends, including when the awaiting
/// request is dropped.
struct LoadingFlag<'a>(&'a AtomicBool);

impl<'a> LoadingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owner of the classifier and its lifecycle state.
pub struct ModelHandle {
    manifest: ModelManifest,
    loader: Arc<dyn ModelLoader>,
    /// Serializes loads and reloads
    transition: Mutex<()>,
    state: RwLock<State>,
    loading: AtomicBool,
    load_attempts: AtomicUsize,
}

impl ModelHandle {
    pub fn new(manifest: ModelManifest, loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            manifest,
            loader,
            transition: Mutex::new(()),
            state: RwLock::new(State::Unloaded),
            loading: AtomicBool::new(false),
            load_attempts: AtomicUsize::new(0),
        }
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    /// Number of load attempts since startup, reloads included.
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }

    /// `Loading` only while a load or reload is running.
    pub fn status(&self) -> ModelStatus {
        if self.loading.load(Ordering::SeqCst) {
            return ModelStatus::Loading;
        }
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Unloaded => ModelStatus::Unloaded,
            State::Ready(_) => ModelStatus::Ready,
            State::Failed(reason) => ModelStatus::Failed {
                reason: reason.clone(),
            },
        }
    }

    /// Loads the model if it is still unloaded.
    pub async fn load(&self) -> Result<(), ModelError> {
        self.ensure_ready().await.map(|_| ())
    }

    /// Returns the ready classifier, loading it first when unloaded.
    ///
    /// Never retries from `FAILED`.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn Classifier>, ModelError> {
        if let Some(outcome) = self.settled() {
            return outcome;
        }

        let _transition = self.transition.lock().await;
        // Another request may have finished the load while this one waited
        if let Some(outcome) = self.settled() {
            return outcome;
        }

        match self.load_classifier().await {
            Ok(classifier) => {
                self.set_state(State::Ready(classifier.clone()));
                Ok(classifier)
            }
            Err(err) => {
                self.set_state(State::Failed(err.to_string()));
                Err(err.into())
            }
        }
    }

    /// Forces a fresh load attempt regardless of the current state.
    ///
    /// A failed reload of a `READY` model keeps serving the classifier that
    /// is already loaded; from any other state it leaves the model `FAILED`.
    pub async fn reload(&self) -> Result<(), ModelError> {
        let _transition = self.transition.lock().await;
        info!("Reloading model from {}", self.manifest.model.path.display());

        match self.load_classifier().await {
            Ok(classifier) => {
                self.set_state(State::Ready(classifier));
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                if matches!(*state, State::Ready(_)) {
                    error!("Reload failed, keeping the loaded model: {err}");
                } else {
                    *state = State::Failed(err.to_string());
                }
                Err(err.into())
            }
        }
    }

    /// Runs one prediction, loading the model on first use.
    pub async fn predict(&self, tensor: PreprocessedTensor) -> Result<Vec<f32>, ModelError> {
        let classifier = self.ensure_ready().await?;

        let expected = classifier.input_shape();
        if tensor.shape() != expected {
            return Err(PredictError::ShapeMismatch {
                expected,
                actual: tensor.shape(),
            }
            .into());
        }

        let worker = classifier.clone();
        let result = tokio::task::spawn_blocking(move || worker.predict(tensor))
            .await
            .unwrap_or_else(|e| {
                Err(PredictError::Backend(format!("prediction task failed: {e}")))
            });

        match result {
            Ok(probs) if probs.len() == classifier.output_width() => Ok(probs),
            Ok(probs) => Err(PredictError::Backend(format!(
                "classifier returned {} probabilities, expected {}",
                probs.len(),
                classifier.output_width()
            ))
            .into()),
            Err(err) => {
                if err.is_unrecoverable() {
                    self.mark_failed(&classifier, &err);
                }
                Err(err.into())
            }
        }
    }

    /// Outcome of a finished load, or `None` while still unloaded.
    fn settled(&self) -> Option<Result<Arc<dyn Classifier>, ModelError>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Ready(classifier) => Some(Ok(classifier.clone())),
            State::Failed(reason) => Some(Err(ModelError::Failed {
                reason: reason.clone(),
            })),
            State::Unloaded => None,
        }
    }

    fn set_state(&self, next: State) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Runs one load attempt. Callers hold the transition mutex.
    async fn load_classifier(&self) -> Result<Arc<dyn Classifier>, LoadError> {
        let _loading = LoadingFlag::raise(&self.loading);
        let attempt = self.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let path = self.manifest.model.path.clone();
        let expected_width = self.manifest.model.output_width;
        info!(attempt, "Loading model from {}", path.display());

        let started = Instant::now();
        let loader = self.loader.clone();
        let manifest = self.manifest.clone();
        let result = tokio::task::spawn_blocking(move || loader.load(&manifest))
            .await
            .unwrap_or_else(|e| Err(LoadError::Worker(format!("load task failed: {e}"))))
            .and_then(|classifier| {
                let actual = classifier.output_width();
                if actual == expected_width {
                    Ok(classifier)
                } else {
                    Err(LoadError::ShapeMismatch {
                        expected: expected_width,
                        actual,
                    })
                }
            });

        match &result {
            Ok(_) => info!(
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                taxonomy = %self.manifest.version,
                "Model ready"
            ),
            Err(err) => error!(attempt, "Model load failed: {err}"),
        }
        result
    }

    fn mark_failed(&self, classifier: &Arc<dyn Classifier>, err: &PredictError) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Only fail the classifier that broke; a reload may have replaced it
        if let State::Ready(current) = &*state {
            if Arc::ptr_eq(current, classifier) {
                error!("Classifier became unusable: {err}");
                *state = State::Failed(err.to_string());
                return;
            }
        }
        warn!("Ignoring failure from a replaced classifier: {err}");
    }
}
