//! Burn classifier backend.
//!
//! Artifacts are `CompactRecorder` records (`.mpk`) of [`LeafNet`], run on
//! the `burn-ndarray` CPU backend.

mod leafnet;
mod worker;

use std::sync::Arc;

use leaf_core::manifest::sha256_file;
use leaf_core::ModelManifest;
use tracing::debug;

use crate::model::{Classifier, LoadError, ModelLoader};

pub use leafnet::{ConvBlock, LeafNet, LeafNetConfig};
pub use worker::{BurnClassifier, InferenceBackend};

/// Record extension the recorder reads and writes.
pub const ARTIFACT_EXTENSION: &str = "mpk";

/// Loads manifest artifacts into a [`BurnClassifier`].
///
/// Order of checks: file exists, digest matches, record deserializes,
/// warm-up output width matches the manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct BurnLoader;

impl ModelLoader for BurnLoader {
    fn load(&self, manifest: &ModelManifest) -> Result<Arc<dyn Classifier>, LoadError> {
        let path = &manifest.model.path;
        if !path.is_file() {
            return Err(LoadError::FileNotFound(path.clone()));
        }

        let actual = sha256_file(path).map_err(|source| LoadError::Io {
            path: path.clone(),
            source,
        })?;
        if actual != manifest.model.sha256 {
            return Err(LoadError::ChecksumMismatch {
                path: path.clone(),
                expected: manifest.model.sha256.clone(),
                actual,
            });
        }
        debug!("Checksum verified for {}", path.display());

        // The recorder swaps any other extension for .mpk, which would read a
        // different file than the one just hashed
        if path.extension().and_then(|ext| ext.to_str()) != Some(ARTIFACT_EXTENSION) {
            return Err(LoadError::DeserializationFailed(format!(
                "{} is not a .{ARTIFACT_EXTENSION} record",
                path.display()
            )));
        }

        let config = LeafNetConfig::new(manifest.model.output_width)
            .with_base_filters(manifest.model.base_filters);
        let classifier = BurnClassifier::spawn(path, config, manifest.input.tensor_shape())?;

        if classifier.output_width() != manifest.model.output_width {
            return Err(LoadError::ShapeMismatch {
                expected: manifest.model.output_width,
                actual: classifier.output_width(),
            });
        }

        Ok(Arc::new(classifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PredictError;
    use crate::preprocess::PreprocessedTensor;
    use crate::test_support::soja_manifest_text;
    use burn::module::Module;
    use burn::record::CompactRecorder;
    use std::path::Path;
    use tempfile::TempDir;

    /// Saves an untrained 16-class network and returns its manifest.
    fn saved_model(dir: &Path, num_classes: usize) -> ModelManifest {
        let device = Default::default();
        let model: LeafNet<InferenceBackend> = LeafNetConfig::new(num_classes)
            .with_base_filters(4)
            .init(&device);
        let path = dir.join("model.mpk");
        model
            .save_file(path.clone(), &CompactRecorder::new())
            .unwrap();

        let digest = sha256_file(&path).unwrap();
        ModelManifest::from_toml_str(&soja_manifest_text("model.mpk", &digest), dir).unwrap()
    }

    #[test]
    fn test_load_and_predict() {
        let dir = TempDir::new().unwrap();
        let manifest = saved_model(dir.path(), 16);

        let classifier = BurnLoader.load(&manifest).unwrap();
        assert_eq!(classifier.output_width(), 16);
        assert_eq!(classifier.input_shape(), [1, 16, 16, 3]);

        let probs = classifier
            .predict(PreprocessedTensor::zeros([1, 16, 16, 3]))
            .unwrap();
        assert_eq!(probs.len(), 16);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_concurrent_predictions_are_served() {
        let dir = TempDir::new().unwrap();
        let classifier = BurnLoader.load(&saved_model(dir.path(), 16)).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let classifier = classifier.clone();
                scope.spawn(move || {
                    let probs = classifier
                        .predict(PreprocessedTensor::zeros([1, 16, 16, 3]))
                        .unwrap();
                    assert_eq!(probs.len(), 16);
                });
            }
        });
    }

    #[test]
    fn test_wrong_input_shape() {
        let dir = TempDir::new().unwrap();
        let classifier = BurnLoader.load(&saved_model(dir.path(), 16)).unwrap();
        let err = classifier
            .predict(PreprocessedTensor::zeros([1, 32, 32, 3]))
            .unwrap_err();
        assert!(matches!(err, PredictError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let text = soja_manifest_text("absent.mpk", &"0".repeat(64));
        let manifest = ModelManifest::from_toml_str(&text, dir.path()).unwrap();
        assert!(matches!(
            BurnLoader.load(&manifest),
            Err(LoadError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut manifest = saved_model(dir.path(), 16);
        manifest.model.sha256 = "0".repeat(64);
        assert!(matches!(
            BurnLoader.load(&manifest),
            Err(LoadError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.mpk");
        std::fs::write(&path, b"not a record").unwrap();
        let digest = sha256_file(&path).unwrap();
        let manifest =
            ModelManifest::from_toml_str(&soja_manifest_text("model.mpk", &digest), dir.path())
                .unwrap();

        assert!(BurnLoader.load(&manifest).is_err());
    }

    #[test]
    fn test_record_for_other_taxonomy_is_rejected() {
        let dir = TempDir::new().unwrap();
        // Trained for 8 classes, manifest claims 16
        let manifest = saved_model(dir.path(), 8);
        assert!(BurnLoader.load(&manifest).is_err());
    }
}
