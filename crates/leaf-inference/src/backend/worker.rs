//! Single-owner inference worker.
//!
//! The burn model lives on one dedicated thread and never leaves it.
//! Requests reach it through a job queue and wait on a per-job reply
//! channel, so forward passes are serialized without a lock.

use std::path::Path;
use std::sync::mpsc;
use std::thread;

use burn::module::Module;
use burn::record::CompactRecorder;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use burn_ndarray::NdArray;
use tracing::{debug, info};

use super::leafnet::{LeafNet, LeafNetConfig};
use crate::model::{Classifier, LoadError, PredictError};
use crate::preprocess::PreprocessedTensor;

pub type InferenceBackend = NdArray<f32>;

type Reply = Result<Vec<f32>, PredictError>;

struct Job {
    input: PreprocessedTensor,
    reply: mpsc::SyncSender<Reply>,
}

/// Handle to a [`LeafNet`] owned by an inference worker thread.
pub struct BurnClassifier {
    jobs: mpsc::Sender<Job>,
    input_shape: [usize; 4],
    output_width: usize,
}

impl BurnClassifier {
    /// Starts a worker that loads the record at `artifact` and runs a warm-up pass.
    ///
    /// Returns once the worker has either loaded the model and run a
    /// zero-input forward pass, or failed to.
    pub fn spawn(
        artifact: &Path,
        config: LeafNetConfig,
        input_shape: [usize; 4],
    ) -> Result<Self, LoadError> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<usize, LoadError>>(1);
        let artifact = artifact.to_path_buf();

        thread::Builder::new()
            .name("leaf-inference".to_string())
            .spawn(move || {
                let device = <InferenceBackend as Backend>::Device::default();
                let model = match load_record(&artifact, &config, &device) {
                    Ok(model) => model,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                let warmup = PreprocessedTensor::zeros(input_shape);
                let width = forward(&model, warmup, &device)
                    .map(|probs| probs.len())
                    .map_err(|e| {
                        LoadError::DeserializationFailed(format!("warm-up pass failed: {e}"))
                    });
                let warmed_up = width.is_ok();
                let _ = ready_tx.send(width);
                if !warmed_up {
                    return;
                }

                for job in jobs_rx {
                    let result = forward(&model, job.input, &device);
                    // Requester may have given up; nothing to do then
                    let _ = job.reply.send(result);
                }
                debug!("Inference worker stopped");
            })
            .map_err(|e| LoadError::Worker(format!("failed to start inference worker: {e}")))?;

        let output_width = ready_rx
            .recv()
            .map_err(|_| LoadError::Worker("inference worker exited during load".to_string()))??;

        info!(output_width, ?input_shape, "Inference worker ready");

        Ok(Self {
            jobs: jobs_tx,
            input_shape,
            output_width,
        })
    }
}

impl Classifier for BurnClassifier {
    fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    fn output_width(&self) -> usize {
        self.output_width
    }

    fn predict(&self, tensor: PreprocessedTensor) -> Result<Vec<f32>, PredictError> {
        if tensor.shape() != self.input_shape {
            return Err(PredictError::ShapeMismatch {
                expected: self.input_shape,
                actual: tensor.shape(),
            });
        }

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.jobs
            .send(Job {
                input: tensor,
                reply: reply_tx,
            })
            .map_err(|_| PredictError::WorkerStopped)?;

        // A dropped reply sender means the worker died mid-job
        reply_rx.recv().map_err(|_| PredictError::WorkerStopped)?
    }
}

fn load_record(
    artifact: &Path,
    config: &LeafNetConfig,
    device: &<InferenceBackend as Backend>::Device,
) -> Result<LeafNet<InferenceBackend>, LoadError> {
    let model: LeafNet<InferenceBackend> = config.init(device);
    model
        .load_file(artifact.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|e| LoadError::DeserializationFailed(format!("{e:?}")))
}

fn forward(
    model: &LeafNet<InferenceBackend>,
    input: PreprocessedTensor,
    device: &<InferenceBackend as Backend>::Device,
) -> Result<Vec<f32>, PredictError> {
    let [n, h, w, c] = input.shape();
    // NHWC upload layout -> NCHW conv layout
    let x = Tensor::<InferenceBackend, 4>::from_floats(
        TensorData::new(input.into_data(), [n, h, w, c]),
        device,
    )
    .permute([0, 3, 1, 2]);

    model
        .forward_softmax(x)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| PredictError::Backend(format!("{e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelError, ModelHandle, ModelLoader, ModelStatus};
    use crate::test_support::soja_manifest;
    use leaf_core::ModelManifest;
    use std::sync::Arc;

    const SHAPE: [usize; 4] = [1, 16, 16, 3];

    /// A classifier whose worker thread has already exited.
    fn stopped_classifier() -> BurnClassifier {
        let (jobs, jobs_rx) = mpsc::channel::<Job>();
        drop(jobs_rx);
        BurnClassifier {
            jobs,
            input_shape: SHAPE,
            output_width: 16,
        }
    }

    struct StoppedWorkerLoader;

    impl ModelLoader for StoppedWorkerLoader {
        fn load(&self, _manifest: &ModelManifest) -> Result<Arc<dyn Classifier>, LoadError> {
            Ok(Arc::new(stopped_classifier()))
        }
    }

    #[test]
    fn test_exited_worker_reports_stopped() {
        let err = stopped_classifier()
            .predict(PreprocessedTensor::zeros(SHAPE))
            .unwrap_err();
        assert!(matches!(err, PredictError::WorkerStopped));
    }

    #[test]
    fn test_worker_dying_mid_job_reports_stopped() {
        let (jobs, jobs_rx) = mpsc::channel::<Job>();
        let worker = thread::spawn(move || {
            // Takes one job and exits without replying
            let _job = jobs_rx.recv();
        });
        let classifier = BurnClassifier {
            jobs,
            input_shape: SHAPE,
            output_width: 16,
        };

        let err = classifier
            .predict(PreprocessedTensor::zeros(SHAPE))
            .unwrap_err();
        assert!(matches!(err, PredictError::WorkerStopped));
        worker.join().unwrap();
    }

    #[tokio::test]
    async fn test_exited_worker_moves_handle_to_failed() {
        let handle = ModelHandle::new(soja_manifest(), Arc::new(StoppedWorkerLoader));
        handle.load().await.unwrap();
        assert_eq!(handle.status(), ModelStatus::Ready);

        let err = handle
            .predict(PreprocessedTensor::zeros(SHAPE))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Predict(PredictError::WorkerStopped)));
        assert!(matches!(handle.status(), ModelStatus::Failed { .. }));

        let err = handle
            .predict(PreprocessedTensor::zeros(SHAPE))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Failed { .. }));
    }
}
