//! Offline evaluation metrics over labelled leaf images.

use serde::{Deserialize, Serialize};

/// Square confusion matrix (actual x predicted).
///
/// Predictions that did not resolve to a class index are counted separately
/// per actual class instead of being dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    cells: Vec<Vec<usize>>,
    unresolved: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            cells: vec![vec![0; num_classes]; num_classes],
            unresolved: vec![0; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.cells.len()
    }

    /// Records one prediction. Out-of-range actual labels are ignored.
    pub fn record(&mut self, actual: usize, predicted: Option<usize>) {
        let Some(row) = self.cells.get_mut(actual) else {
            return;
        };
        match predicted.and_then(|p| row.get_mut(p)) {
            Some(cell) => *cell += 1,
            None => self.unresolved[actual] += 1,
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.cells
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.cells
    }

    /// Unresolved predictions for an actual class
    pub fn unresolved(&self, actual: usize) -> usize {
        self.unresolved.get(actual).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.cells.iter().flatten().sum::<usize>() + self.unresolved.iter().sum::<usize>()
    }

    /// Renders the matrix as CSV with a header row of class labels.
    pub fn to_csv(&self, labels: &[String]) -> String {
        let label = |i: usize| labels.get(i).cloned().unwrap_or_else(|| i.to_string());

        let mut csv = String::from("actual");
        for i in 0..self.num_classes() {
            csv.push(',');
            csv.push_str(&label(i));
        }
        csv.push_str(",unresolved\n");

        for (actual, row) in self.cells.iter().enumerate() {
            csv.push_str(&label(actual));
            for count in row {
                csv.push_str(&format!(",{count}"));
            }
            csv.push_str(&format!(",{}\n", self.unresolved[actual]));
        }
        csv
    }
}

/// Precision, recall and F1 for one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub index: usize,
    pub id: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of samples whose actual label is this class
    pub support: usize,
    /// Mean uncalibrated confidence over this class's samples
    pub mean_raw_confidence: f64,
}

/// Summary of an evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Overall accuracy; unresolved predictions count as wrong
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    /// Mean uncalibrated confidence of the winning class
    pub mean_raw_confidence: f64,
    pub num_samples: usize,
    pub num_unresolved: usize,
    pub per_class: Vec<ClassMetrics>,
}

impl EvaluationMetrics {
    /// Computes metrics from a filled confusion matrix.
    ///
    /// `class_ids` names the rows; classes without any support are left out
    /// of the macro averages. `raw_confidences` holds `(actual, raw)` pairs.
    pub fn compute(
        matrix: &ConfusionMatrix,
        class_ids: &[String],
        raw_confidences: &[(usize, f32)],
    ) -> Self {
        let num_classes = matrix.num_classes();
        let num_samples = matrix.total();
        let num_unresolved = (0..num_classes).map(|i| matrix.unresolved(i)).sum();
        let correct: usize = (0..num_classes).map(|i| matrix.get(i, i)).sum();

        let mut per_class = Vec::with_capacity(num_classes);
        for class in 0..num_classes {
            let true_positives = matrix.get(class, class) as f64;
            let predicted_as: f64 = (0..num_classes).map(|i| matrix.get(i, class) as f64).sum();
            let support =
                matrix.rows()[class].iter().sum::<usize>() + matrix.unresolved(class);

            let precision = ratio(true_positives, predicted_as);
            let recall = ratio(true_positives, support as f64);
            let f1 = if precision + recall > 0.0 {
                2.0 * (precision * recall) / (precision + recall)
            } else {
                0.0
            };

            per_class.push(ClassMetrics {
                index: class,
                id: class_ids
                    .get(class)
                    .cloned()
                    .unwrap_or_else(|| class.to_string()),
                precision,
                recall,
                f1,
                support,
                mean_raw_confidence: mean(
                    raw_confidences
                        .iter()
                        .filter(|(actual, _)| *actual == class)
                        .map(|&(_, raw)| raw),
                ),
            });
        }

        let supported: Vec<&ClassMetrics> = per_class.iter().filter(|m| m.support > 0).collect();
        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if supported.is_empty() {
                0.0
            } else {
                supported.iter().map(|m| f(m)).sum::<f64>() / supported.len() as f64
            }
        };

        let mean_raw_confidence = mean(raw_confidences.iter().map(|&(_, raw)| raw));

        Self {
            accuracy: ratio(correct as f64, num_samples as f64),
            macro_precision: macro_avg(|m| m.precision),
            macro_recall: macro_avg(|m| m.recall),
            macro_f1: macro_avg(|m| m.f1),
            mean_raw_confidence,
            num_samples,
            num_unresolved,
            per_class,
        }
    }

    /// Per-class metrics as CSV
    pub fn per_class_csv(&self) -> String {
        let mut csv =
            String::from("index,id,precision,recall,f1,support,mean_raw_confidence\n");
        for m in &self.per_class {
            csv.push_str(&format!(
                "{},{},{:.4},{:.4},{:.4},{},{:.4}\n",
                m.index, m.id, m.precision, m.recall, m.f1, m.support, m.mean_raw_confidence
            ));
        }
        csv
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f64 {
    let (sum, count) = values.fold((0.0_f64, 0_usize), |(sum, count), v| {
        (sum + v as f64, count + 1)
    });
    ratio(sum, count as f64)
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    #[test]
    fn test_record_and_total() {
        let mut matrix = ConfusionMatrix::new(3);
        matrix.record(0, Some(0));
        matrix.record(0, Some(1));
        matrix.record(1, None);
        matrix.record(2, Some(7));
        matrix.record(9, Some(0));

        assert_eq!(matrix.get(0, 0), 1);
        assert_eq!(matrix.get(0, 1), 1);
        assert_eq!(matrix.unresolved(1), 1);
        assert_eq!(matrix.unresolved(2), 1);
        assert_eq!(matrix.total(), 4);
    }

    #[test]
    fn test_compute_metrics() {
        let mut matrix = ConfusionMatrix::new(2);
        // class 0: 3 correct, 1 predicted as class 1
        for _ in 0..3 {
            matrix.record(0, Some(0));
        }
        matrix.record(0, Some(1));
        // class 1: 2 correct
        matrix.record(1, Some(1));
        matrix.record(1, Some(1));

        let metrics = EvaluationMetrics::compute(&matrix, &ids(2), &[(0, 0.5), (1, 1.0)]);
        assert_eq!(metrics.num_samples, 6);
        assert!((metrics.accuracy - 5.0 / 6.0).abs() < 1e-9);
        assert!((metrics.per_class[0].precision - 1.0).abs() < 1e-9);
        assert!((metrics.per_class[0].recall - 0.75).abs() < 1e-9);
        assert!((metrics.per_class[1].precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.per_class[1].recall - 1.0).abs() < 1e-9);
        assert!((metrics.mean_raw_confidence - 0.75).abs() < 1e-9);
        assert!((metrics.per_class[0].mean_raw_confidence - 0.5).abs() < 1e-9);
        assert!((metrics.per_class[1].mean_raw_confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unresolved_counts_as_miss() {
        let mut matrix = ConfusionMatrix::new(2);
        matrix.record(0, Some(0));
        matrix.record(0, None);

        let metrics = EvaluationMetrics::compute(&matrix, &ids(2), &[]);
        assert_eq!(metrics.num_unresolved, 1);
        assert!((metrics.accuracy - 0.5).abs() < 1e-9);
        assert!((metrics.per_class[0].recall - 0.5).abs() < 1e-9);
        // class 1 has no support and stays out of the macro average
        assert!((metrics.macro_recall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_matrix() {
        let metrics = EvaluationMetrics::compute(&ConfusionMatrix::new(3), &ids(3), &[]);
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.macro_f1, 0.0);
        assert_eq!(metrics.num_samples, 0);
    }

    #[test]
    fn test_csv_output() {
        let mut matrix = ConfusionMatrix::new(2);
        matrix.record(1, Some(0));
        matrix.record(1, None);
        let csv = matrix.to_csv(&ids(2));
        assert!(csv.starts_with("actual,class_0,class_1,unresolved\n"));
        assert!(csv.contains("class_1,1,0,1\n"));

        let metrics = EvaluationMetrics::compute(&matrix, &ids(2), &[]);
        assert!(metrics.per_class_csv().contains("1,class_1,0.0000,0.0000,0.0000,2,0.0000\n"));
    }
}
