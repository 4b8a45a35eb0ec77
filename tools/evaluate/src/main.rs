//! Evaluation CLI Tool
//!
//! Runs every image of a labelled directory tree (one subdirectory per class
//! id) through the inference pipeline and reports accuracy, per-class
//! precision/recall/F1 and a confusion matrix.
//!
//! Scores are computed from the model's raw confidence; the calibrated value
//! shown to users is never read here.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use leaf_core::cli::setup_logging;
use leaf_core::{ConfusionMatrix, EvaluationMetrics, ServiceConfig, TaxonomyRegistry};
use leaf_inference::InferenceService;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Image extensions read from the dataset
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Leaf Disease Model Evaluation Tool
#[derive(Parser, Debug)]
#[command(
    name = "leaf-evaluate",
    about = "Evaluate a leaf disease model on a labelled image tree",
    long_about = "Classify every image below --dataset-dir with the configured model and \
                  write accuracy, per-class metrics and a confusion matrix to --output."
)]
struct Args {
    /// Service configuration (manifest, calibration, upload limits)
    #[arg(short, long, value_name = "FILE", default_value = "leaf.toml")]
    config: PathBuf,

    /// Dataset directory with one subdirectory per class id
    #[arg(short = 'd', long, value_name = "DIR")]
    dataset_dir: PathBuf,

    /// Output directory for results
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    /// Export confusion matrix to CSV
    #[arg(long)]
    export_confusion_matrix: bool,

    /// Export per-class metrics to CSV
    #[arg(long)]
    export_per_class: bool,

    /// Save per-image predictions to a CSV file
    #[arg(long, value_name = "FILE")]
    save_predictions: Option<PathBuf>,

    /// Print detailed per-class results
    #[arg(long)]
    detailed: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One labelled image
#[derive(Debug, Clone, PartialEq, Eq)]
struct Sample {
    path: PathBuf,
    actual: usize,
}

/// Outcome for one image
#[derive(Debug, Clone)]
struct SamplePrediction {
    path: PathBuf,
    actual: usize,
    predicted: Option<usize>,
    raw_confidence: f32,
}

/// Accumulated results of one pass over the dataset
#[derive(Debug)]
struct Evaluation {
    matrix: ConfusionMatrix,
    raw_confidences: Vec<(usize, f32)>,
    predictions: Vec<SamplePrediction>,
    failures: usize,
}

/// Written to `evaluation_summary.json`
#[derive(Debug, Serialize)]
struct EvaluationReport {
    generated_at: DateTime<Utc>,
    dataset_dir: PathBuf,
    manifest: PathBuf,
    taxonomy_version: String,
    model_sha256: String,
    class_ids: Vec<String>,
    metrics: EvaluationMetrics,
    confusion_matrix: ConfusionMatrix,
    /// Images that could not be classified at all
    failures: usize,
    skipped_dirs: Vec<String>,
    eval_time_secs: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging("info", args.verbose)?;

    info!("Leaf Disease Classification - Evaluation Tool");
    info!("==============================================");

    validate_inputs(&args)?;
    std::fs::create_dir_all(&args.output).context("Failed to create output directory")?;

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {}", args.config.display()))?;
    let service = InferenceService::from_config(&config).context("Failed to build service")?;
    service
        .model()
        .load()
        .await
        .context("Failed to load model")?;

    let registry = service.registry();
    info!("Taxonomy: {} ({} classes)", registry.version(), registry.len());

    info!("Scanning dataset: {}", args.dataset_dir.display());
    let (samples, skipped_dirs) = collect_samples(&args.dataset_dir, registry)?;
    if samples.is_empty() {
        anyhow::bail!(
            "No labelled images found in {}",
            args.dataset_dir.display()
        );
    }
    info!("Loaded {} samples", samples.len());

    let started = Instant::now();
    let keep_predictions = args.save_predictions.is_some();
    let evaluation = run_evaluation(&service, &samples, keep_predictions).await?;
    let eval_time_secs = started.elapsed().as_secs_f64();

    let class_ids = class_ids(registry);
    let metrics =
        EvaluationMetrics::compute(&evaluation.matrix, &class_ids, &evaluation.raw_confidences);

    print_results(&metrics, evaluation.failures, eval_time_secs, args.detailed);

    let report = EvaluationReport {
        generated_at: Utc::now(),
        dataset_dir: args.dataset_dir.clone(),
        manifest: config.manifest.clone(),
        taxonomy_version: registry.version().to_string(),
        model_sha256: registry.model_sha256().to_string(),
        class_ids,
        metrics,
        confusion_matrix: evaluation.matrix.clone(),
        failures: evaluation.failures,
        skipped_dirs,
        eval_time_secs,
    };
    export_results(&report, &evaluation, registry, &args)?;

    info!("Evaluation completed");
    info!("Results saved to: {}", args.output.display());
    Ok(())
}

fn validate_inputs(args: &Args) -> Result<()> {
    if !args.config.is_file() {
        anyhow::bail!("Config file does not exist: {}", args.config.display());
    }
    if !args.dataset_dir.is_dir() {
        anyhow::bail!(
            "Dataset directory does not exist: {}",
            args.dataset_dir.display()
        );
    }
    Ok(())
}

fn class_ids(registry: &TaxonomyRegistry) -> Vec<String> {
    registry
        .taxonomy()
        .entries()
        .iter()
        .map(|entry| entry.id.clone())
        .collect()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Collects images below each class directory, sorted by path.
///
/// Returns the samples and the names of directories that match no class id.
fn collect_samples(
    dataset_dir: &Path,
    registry: &TaxonomyRegistry,
) -> Result<(Vec<Sample>, Vec<String>)> {
    let mut samples = Vec::new();
    let mut skipped = Vec::new();

    let class_dirs = WalkDir::new(dataset_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();

    for entry in class_dirs {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(class) = registry.taxonomy().find_id(&name) else {
            warn!("Skipping directory '{name}': not a class id of this taxonomy");
            skipped.push(name);
            continue;
        };

        let before = samples.len();
        for file in WalkDir::new(entry.path()).sort_by_file_name() {
            let file = file?;
            if file.file_type().is_file() && is_image(file.path()) {
                samples.push(Sample {
                    path: file.into_path(),
                    actual: class.index,
                });
            }
        }
        debug!("{name}: {} images", samples.len() - before);
    }

    Ok((samples, skipped))
}

/// Classifies every sample. Per-image failures are logged and counted.
async fn run_evaluation(
    service: &InferenceService,
    samples: &[Sample],
    keep_predictions: bool,
) -> Result<Evaluation> {
    let mut evaluation = Evaluation {
        matrix: ConfusionMatrix::new(service.registry().len()),
        raw_confidences: Vec::with_capacity(samples.len()),
        predictions: Vec::new(),
        failures: 0,
    };

    let progress = ProgressBar::new(samples.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} images ({eta})")?
            .progress_chars("=>-"),
    );

    for sample in samples {
        progress.inc(1);

        let bytes = match std::fs::read(&sample.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("Failed to read {}: {err}", sample.path.display());
                evaluation.failures += 1;
                continue;
            }
        };

        let result = match service.classify(bytes).await {
            Ok(result) => result,
            Err(err) => {
                warn!("Failed to classify {}: {err}", sample.path.display());
                evaluation.failures += 1;
                continue;
            }
        };

        evaluation.matrix.record(sample.actual, result.class_index);
        evaluation
            .raw_confidences
            .push((sample.actual, result.raw_confidence));
        if keep_predictions {
            evaluation.predictions.push(SamplePrediction {
                path: sample.path.clone(),
                actual: sample.actual,
                predicted: result.class_index,
                raw_confidence: result.raw_confidence,
            });
        }
    }

    progress.finish_with_message("Evaluation completed");
    Ok(evaluation)
}

fn print_results(metrics: &EvaluationMetrics, failures: usize, eval_time: f64, detailed: bool) {
    info!("");
    info!("=== Evaluation Results ===");
    info!("Accuracy:           {:.4}", metrics.accuracy);
    info!("Macro precision:    {:.4}", metrics.macro_precision);
    info!("Macro recall:       {:.4}", metrics.macro_recall);
    info!("Macro F1:           {:.4}", metrics.macro_f1);
    info!("Mean raw confidence {:.4}", metrics.mean_raw_confidence);
    info!(
        "Samples: {} ({} unresolved, {} failed)",
        metrics.num_samples, metrics.num_unresolved, failures
    );
    info!("Evaluation time: {:.2}s", eval_time);
    info!("");

    if detailed {
        info!("=== Per-Class Results ===");
        info!(
            "  {:<32} {:>9} {:>9} {:>9} {:>8}",
            "class", "precision", "recall", "f1", "support"
        );
        for m in metrics.per_class.iter().filter(|m| m.support > 0) {
            info!(
                "  {:<32} {:>9.4} {:>9.4} {:>9.4} {:>8}",
                m.id, m.precision, m.recall, m.f1, m.support
            );
        }
    } else {
        info!("(use --detailed for full per-class results)");
    }
}

fn export_results(
    report: &EvaluationReport,
    evaluation: &Evaluation,
    registry: &TaxonomyRegistry,
    args: &Args,
) -> Result<()> {
    let summary_path = args.output.join("evaluation_summary.json");
    std::fs::write(&summary_path, serde_json::to_string_pretty(report)?)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    info!("Summary exported to: {}", summary_path.display());

    if args.export_confusion_matrix {
        let path = args.output.join("confusion_matrix.csv");
        std::fs::write(&path, report.confusion_matrix.to_csv(&report.class_ids))?;
        info!("Confusion matrix exported to: {}", path.display());
    }

    if args.export_per_class {
        let path = args.output.join("per_class_metrics.csv");
        std::fs::write(&path, report.metrics.per_class_csv())?;
        info!("Per-class metrics exported to: {}", path.display());
    }

    if let Some(path) = &args.save_predictions {
        std::fs::write(path, predictions_csv(&evaluation.predictions, registry))?;
        info!("Predictions saved to: {}", path.display());
    }

    Ok(())
}

fn predictions_csv(predictions: &[SamplePrediction], registry: &TaxonomyRegistry) -> String {
    let id = |index: usize| {
        registry
            .resolve(index)
            .map(|entry| entry.id.clone())
            .unwrap_or_else(|_| index.to_string())
    };

    let mut csv = String::from("path,actual,predicted,raw_confidence\n");
    for p in predictions {
        csv.push_str(&format!(
            "{},{},{},{:.4}\n",
            quote_csv(&p.path.display().to_string()),
            id(p.actual),
            p.predicted.map(id).unwrap_or_default(),
            p.raw_confidence
        ));
    }
    csv
}

/// Quotes a CSV field, doubling embedded quotes.
fn quote_csv(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
