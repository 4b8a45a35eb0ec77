//! Core types for the leaf disease inference service.
//!
//! This crate holds everything the server, the inference pipeline and the
//! evaluation tool agree on: the error type, the service configuration, the
//! model manifest that pairs an artifact with the class taxonomy it was
//! trained on, and evaluation metrics.

pub mod cli;
pub mod config;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod taxonomy;

pub use config::{
    CalibrationConfig, CalibrationStrategy, LabelConfig, LoadPolicy, LoggingConfig, ServerConfig,
    ServiceConfig, UploadConfig,
};
pub use error::{Error, Result};
pub use manifest::{ArtifactSpec, ClassSpec, InputSpec, ModelManifest, ResizeFilter};
pub use metrics::{ClassMetrics, ConfusionMatrix, EvaluationMetrics};
pub use taxonomy::{ClassEntry, ClassTaxonomy, TaxonomyError, TaxonomyRegistry};
