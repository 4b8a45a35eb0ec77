//! Prediction postprocessing: winner selection, label resolution and
//! confidence calibration.

use std::sync::Arc;

use leaf_core::{CalibrationConfig, CalibrationStrategy, TaxonomyRegistry};
use serde::Serialize;
use tracing::warn;

/// `class_id` reported when the winning index has no taxonomy entry.
pub const UNKNOWN_CLASS_ID: &str = "unknown";

/// Outcome of one classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub class_id: String,
    pub display_name: String,
    /// Probability of the winning class as produced by the model
    pub raw_confidence: f32,
    /// Confidence after calibration, for display only
    pub reported_confidence: f32,
    /// Winning output index; `None` when it could not be resolved
    pub class_index: Option<usize>,
    pub placeholder: bool,
    pub taxonomy_version: String,
}

/// Index of the largest probability. Ties go to the lowest index and NaN
/// entries are skipped.
pub fn argmax(probs: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &p) in probs.iter().enumerate() {
        if p.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if p <= top => {}
            _ => best = Some((index, p)),
        }
    }
    best.map(|(index, _)| index)
}

/// Affine floor calibration.
///
/// Scores below `threshold` are mapped to `threshold + raw * (1 - threshold)`;
/// scores at or above it are returned unchanged.
pub fn calibrate(raw: f32, threshold: f32) -> f32 {
    let raw = raw.clamp(0.0, 1.0);
    if raw < threshold {
        threshold + raw * (1.0 - threshold)
    } else {
        raw
    }
}

/// Turns a probability vector into a [`PredictionResult`].
#[derive(Debug, Clone)]
pub struct Postprocessor {
    registry: Arc<TaxonomyRegistry>,
    calibration: CalibrationConfig,
    unidentified_label: String,
}

impl Postprocessor {
    pub fn new(
        registry: Arc<TaxonomyRegistry>,
        calibration: CalibrationConfig,
        unidentified_label: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            calibration,
            unidentified_label: unidentified_label.into(),
        }
    }

    pub fn registry(&self) -> &TaxonomyRegistry {
        &self.registry
    }

    /// Applies the configured calibration strategy.
    pub fn reported_confidence(&self, raw: f32) -> f32 {
        match self.calibration.strategy {
            CalibrationStrategy::AffineFloor => calibrate(raw, self.calibration.threshold),
            CalibrationStrategy::Identity => raw.clamp(0.0, 1.0),
        }
    }

    /// Never fails: an unmapped index yields the unidentified sentinel.
    pub fn finalize(&self, probs: &[f32]) -> PredictionResult {
        let winner = argmax(probs);
        let raw_confidence = winner.map(|i| probs[i].clamp(0.0, 1.0)).unwrap_or(0.0);
        let reported_confidence = self.reported_confidence(raw_confidence);
        let taxonomy_version = self.registry.version().to_string();

        let resolved = winner.map(|index| (index, self.registry.resolve(index)));
        match resolved {
            Some((index, Ok(entry))) => PredictionResult {
                class_id: entry.id.clone(),
                display_name: if entry.placeholder {
                    self.unidentified_label.clone()
                } else {
                    entry.display_name.clone()
                },
                raw_confidence,
                reported_confidence,
                class_index: Some(index),
                placeholder: entry.placeholder,
                taxonomy_version,
            },
            Some((_, Err(err))) => {
                warn!(taxonomy = %taxonomy_version, "Unmapped prediction: {err}");
                self.sentinel(raw_confidence, reported_confidence, taxonomy_version)
            }
            None => {
                warn!(width = probs.len(), "Probability vector has no usable entries");
                self.sentinel(raw_confidence, reported_confidence, taxonomy_version)
            }
        }
    }

    fn sentinel(
        &self,
        raw_confidence: f32,
        reported_confidence: f32,
        taxonomy_version: String,
    ) -> PredictionResult {
        PredictionResult {
            class_id: UNKNOWN_CLASS_ID.to_string(),
            display_name: self.unidentified_label.clone(),
            raw_confidence,
            reported_confidence,
            class_index: None,
            placeholder: false,
            taxonomy_version,
        }
    }
}
