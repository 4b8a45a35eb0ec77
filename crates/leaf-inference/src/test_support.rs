//! Scripted classifiers, loaders and fixtures shared by the unit tests.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat};
use leaf_core::{InputSpec, ModelManifest, ResizeFilter};

use crate::model::{Classifier, LoadError, ModelLoader, PredictError};
use crate::preprocess::PreprocessedTensor;

pub const HEALTHY_INDEX: usize = 13;

pub fn input_spec(width: u32, height: u32, resize: ResizeFilter) -> InputSpec {
    InputSpec {
        height,
        width,
        resize,
    }
}

pub fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

/// Sixteen-class soybean manifest with a 16x16 input.
pub fn soja_manifest() -> ModelManifest {
    ModelManifest::from_toml_str(&soja_manifest_text("model.mpk", &"ab".repeat(32)), Path::new("."))
        .unwrap()
}

pub fn soja_manifest_text(path: &str, sha256: &str) -> String {
    let mut text = format!(
        r#"
version = "soja-16/test"

[model]
path = "{path}"
sha256 = "{sha256}"
output_width = 16
base_filters = 4

[input]
height = 16
width = 16
resize = "triangle"
"#
    );
    let named = [
        (0, "antracnose", None),
        (1, "crestamento_foliar_cercospora", None),
        (2, "ferrugem_asiatica", Some("Ferrugem Asiática")),
        (3, "mancha_alvo", None),
        (4, "mancha_olho_de_ra", Some("Mancha Olho-de-Rã")),
        (5, "mildio", Some("Míldio")),
        (6, "oidio", Some("Oídio")),
        (13, "saudavel", Some("Folha Saudável")),
    ];
    for index in 0..16 {
        match named.iter().find(|(i, _, _)| *i == index) {
            Some((_, id, Some(display))) => text.push_str(&format!(
                "\n[[classes]]\nindex = {index}\nid = \"{id}\"\ndisplay_name = \"{display}\"\n"
            )),
            Some((_, id, None)) => {
                text.push_str(&format!("\n[[classes]]\nindex = {index}\nid = \"{id}\"\n"))
            }
            None => text.push_str(&format!(
                "\n[[classes]]\nindex = {index}\nid = \"classe_{index}\"\nplaceholder = true\n"
            )),
        }
    }
    text
}

/// Probability vector of width 16 peaking at `index`.
pub fn peaked(index: usize, peak: f32) -> Vec<f32> {
    let rest = (1.0 - peak) / 15.0;
    (0..16).map(|i| if i == index { peak } else { rest }).collect()
}

/// Classifier returning a fixed vector, or a fixed error.
pub struct ScriptedClassifier {
    pub input_shape: [usize; 4],
    pub output: Result<Vec<f32>, PredictError>,
    pub calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn returning(probs: Vec<f32>) -> Self {
        Self {
            input_shape: [1, 16, 16, 3],
            output: Ok(probs),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(err: PredictError) -> Self {
        Self {
            input_shape: [1, 16, 16, 3],
            output: Err(err),
            calls: AtomicUsize::new(0),
        }
    }
}

impl Classifier for ScriptedClassifier {
    fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    fn output_width(&self) -> usize {
        match &self.output {
            Ok(probs) => probs.len(),
            Err(_) => 16,
        }
    }

    fn predict(&self, _tensor: PreprocessedTensor) -> Result<Vec<f32>, PredictError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone()
    }
}

/// Loader that counts calls and hands out a shared classifier.
pub struct ScriptedLoader {
    pub classifier: Arc<ScriptedClassifier>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Duration,
}

impl ScriptedLoader {
    pub fn new(classifier: ScriptedClassifier) -> Self {
        Self {
            classifier: Arc::new(classifier),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn missing_artifact(classifier: ScriptedClassifier) -> Self {
        let loader = Self::new(classifier);
        loader.fail.store(true, Ordering::SeqCst);
        loader
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, manifest: &ModelManifest) -> Result<Arc<dyn Classifier>, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LoadError::FileNotFound(PathBuf::from(&manifest.model.path)));
        }
        Ok(self.classifier.clone())
    }
}
