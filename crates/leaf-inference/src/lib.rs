//! Leaf disease inference pipeline.
//!
//! Request flow: [`Preprocessor`] turns upload bytes into a fixed-shape
//! tensor, [`ModelHandle`] runs the classifier, [`Postprocessor`] picks the
//! winning class, resolves it through the taxonomy and calibrates the
//! confidence. [`InferenceService`] ties the three together.

pub mod backend;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{BurnClassifier, BurnLoader, LeafNet, LeafNetConfig};
pub use model::{
    Classifier, LoadError, ModelError, ModelHandle, ModelLoader, ModelStatus, PredictError,
};
pub use postprocess::{argmax, calibrate, Postprocessor, PredictionResult, UNKNOWN_CLASS_ID};
pub use preprocess::{DefaultDecoder, ImageDecoder, ImageError, PreprocessedTensor, Preprocessor};
pub use service::{InferenceService, ServiceError};
