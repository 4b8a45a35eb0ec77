//! Model manifest: the versioned pairing of an artifact and its taxonomy.
//!
//! The manifest is the single source of truth for what a model file means.
//! It records the artifact path and SHA-256 digest, the declared output width,
//! the input geometry including the resampling filter used at training time,
//! and the ordered class list.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::taxonomy::{derive_display_name, ClassEntry, ClassTaxonomy, TaxonomyRegistry};
use crate::{Error, Result};

/// Smallest accepted input side. LeafNet halves the feature map four times.
pub const MIN_INPUT_SIDE: u32 = 16;

/// Resampling filter applied when resizing uploads to the model input.
///
/// There is deliberately no default: the value must match the training
/// pipeline and therefore has to be written down in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    /// Nearest neighbour
    Nearest,
    /// Linear (triangle) filter
    Triangle,
    /// Cubic filter
    CatmullRom,
    /// Gaussian filter
    Gaussian,
    /// Lanczos with window 3
    Lanczos3,
    /// Area-aware bilinear filter matching PIL's `Image.resize(BILINEAR)`
    PilBilinear,
}

impl std::fmt::Display for ResizeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResizeFilter::Nearest => write!(f, "nearest"),
            ResizeFilter::Triangle => write!(f, "triangle"),
            ResizeFilter::CatmullRom => write!(f, "catmull_rom"),
            ResizeFilter::Gaussian => write!(f, "gaussian"),
            ResizeFilter::Lanczos3 => write!(f, "lanczos3"),
            ResizeFilter::PilBilinear => write!(f, "pil_bilinear"),
        }
    }
}

/// Model artifact section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Artifact location; relative paths resolve against the manifest directory
    pub path: PathBuf,
    /// Expected SHA-256 of the artifact as hexadecimal
    pub sha256: String,
    /// Width of the probability vector the model produces
    pub output_width: usize,
    /// Base number of convolutional filters of the network
    #[serde(default = "default_base_filters")]
    pub base_filters: usize,
}

fn default_base_filters() -> usize {
    32
}

/// Input geometry section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    pub height: u32,
    pub width: u32,
    pub resize: ResizeFilter,
}

impl InputSpec {
    /// Tensor shape `[batch, height, width, channels]`.
    pub fn tensor_shape(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, 3]
    }
}

/// One `[[classes]]` entry as written in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassSpec {
    pub index: usize,
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub placeholder: bool,
}

impl ClassSpec {
    fn to_entry(&self) -> ClassEntry {
        ClassEntry {
            index: self.index,
            id: self.id.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| derive_display_name(&self.id)),
            placeholder: self.placeholder,
        }
    }
}

/// Parsed model manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelManifest {
    /// Taxonomy/artifact version label
    pub version: String,
    pub model: ArtifactSpec,
    pub input: InputSpec,
    pub classes: Vec<ClassSpec>,
}

impl ModelManifest {
    /// Reads, parses and validates a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Manifest {
            path: path.to_path_buf(),
            reason: format!("failed to read: {e}"),
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let manifest = Self::from_toml_str(&content, base_dir).map_err(|e| match e {
            Error::Manifest { reason, .. } => Error::Manifest {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        debug!(
            version = %manifest.version,
            classes = manifest.classes.len(),
            "Loaded model manifest {}",
            path.display()
        );
        Ok(manifest)
    }

    /// Parses manifest text, resolving a relative artifact path against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: ModelManifest = toml::from_str(content).map_err(|e| Error::Manifest {
            path: base_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        if manifest.model.path.is_relative() {
            manifest.model.path = base_dir.join(&manifest.model.path);
        }
        manifest.model.sha256 = normalise_hex(&manifest.model.sha256);
        manifest.validate()?;

        Ok(manifest)
    }

    /// Checks field ranges and that the taxonomy binds to the declared width.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::Manifest {
            path: self.model.path.clone(),
            reason,
        };

        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty".to_string()));
        }
        if !is_sha256_hex(&self.model.sha256) {
            return Err(invalid(format!(
                "model.sha256 must be 64 hexadecimal characters, got '{}'",
                self.model.sha256
            )));
        }
        if self.model.output_width == 0 {
            return Err(invalid("model.output_width must be greater than 0".to_string()));
        }
        if self.model.base_filters == 0 {
            return Err(invalid("model.base_filters must be greater than 0".to_string()));
        }
        if self.input.height < MIN_INPUT_SIDE || self.input.width < MIN_INPUT_SIDE {
            return Err(invalid(format!(
                "input size must be at least {MIN_INPUT_SIDE}x{MIN_INPUT_SIDE}, got {}x{}",
                self.input.width, self.input.height
            )));
        }

        self.registry()?;
        Ok(())
    }

    /// Builds the taxonomy registry, bound to the declared output width.
    pub fn registry(&self) -> Result<TaxonomyRegistry> {
        let entries = self.classes.iter().map(ClassSpec::to_entry).collect();
        let taxonomy = ClassTaxonomy::new(entries)?;
        let registry = TaxonomyRegistry::new(&self.version, &self.model.sha256, taxonomy);
        registry.bind(self.model.output_width)?;
        Ok(registry)
    }
}

/// Computes the SHA-256 digest of the file at `path` as lowercase hex.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn normalise_hex(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaxonomyError;
    use std::io::Write;
    use tempfile::TempDir;

    const DIGEST: &str = "ABCDEF0123456789abcdef0123456789abcdef0123456789abcdef0123456789";

    fn manifest_text(output_width: usize, classes: usize) -> String {
        let mut text = format!(
            r#"
version = "test/1"

[model]
path = "model.mpk"
sha256 = " {DIGEST} "
output_width = {output_width}

[input]
height = 64
width = 64
resize = "catmull_rom"
"#
        );
        for i in 0..classes {
            text.push_str(&format!("\n[[classes]]\nindex = {i}\nid = \"class_{i}\"\n"));
        }
        text
    }

    #[test]
    fn test_parse_resolves_relative_path_and_normalises_digest() {
        let manifest =
            ModelManifest::from_toml_str(&manifest_text(3, 3), Path::new("/srv/models")).unwrap();
        assert_eq!(manifest.model.path, PathBuf::from("/srv/models/model.mpk"));
        assert_eq!(manifest.model.sha256, DIGEST.to_ascii_lowercase());
        assert_eq!(manifest.model.base_filters, 32);
        assert_eq!(manifest.input.resize, ResizeFilter::CatmullRom);
        assert_eq!(manifest.input.tensor_shape(), [1, 64, 64, 3]);
    }

    #[test]
    fn test_width_mismatch_is_fatal() {
        let err =
            ModelManifest::from_toml_str(&manifest_text(16, 8), Path::new(".")).unwrap_err();
        assert!(matches!(
            err,
            Error::Taxonomy(TaxonomyError::IncompatibleTaxonomy {
                taxonomy_len: 8,
                model_output_width: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_resize_filter_is_required() {
        let text = manifest_text(2, 2).replace("resize = \"catmull_rom\"\n", "");
        let err = ModelManifest::from_toml_str(&text, Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
    }

    #[test]
    fn test_bad_digest_rejected() {
        let text = manifest_text(2, 2).replace(DIGEST, "not-a-digest");
        let err = ModelManifest::from_toml_str(&text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }

    #[test]
    fn test_input_smaller_than_pooling_depth_rejected() {
        let text = manifest_text(2, 2).replace("width = 64", "width = 8");
        let err = ModelManifest::from_toml_str(&text, Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::Manifest { .. }));
        assert!(err.to_string().contains("at least 16x16"));

        let text = manifest_text(2, 2)
            .replace("height = 64", "height = 16")
            .replace("width = 64", "width = 16");
        let manifest = ModelManifest::from_toml_str(&text, Path::new(".")).unwrap();
        assert_eq!(manifest.input.tensor_shape(), [1, 16, 16, 3]);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = manifest_text(2, 2).replace("[input]", "[input]\nchannels = 4");
        assert!(ModelManifest::from_toml_str(&text, Path::new(".")).is_err());
    }

    #[test]
    fn test_display_names_and_placeholders() {
        let text = format!(
            "{}\n[[classes]]\nindex = 0\nid = \"saudavel\"\ndisplay_name = \"Folha Saudável\"\n\
             \n[[classes]]\nindex = 1\nid = \"mancha_alvo\"\n\
             \n[[classes]]\nindex = 2\nid = \"classe_2\"\nplaceholder = true\n",
            manifest_text(3, 0)
        );
        let manifest = ModelManifest::from_toml_str(&text, Path::new(".")).unwrap();
        let registry = manifest.registry().unwrap();
        assert_eq!(registry.resolve(0).unwrap().display_name, "Folha Saudável");
        assert_eq!(registry.resolve(1).unwrap().display_name, "Mancha Alvo");
        assert!(registry.resolve(2).unwrap().placeholder);
        assert_eq!(registry.model_sha256(), DIGEST.to_ascii_lowercase());
    }

    #[test]
    fn test_load_reports_file_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.toml");
        std::fs::write(&path, manifest_text(16, 15)).unwrap();

        let err = ModelManifest::load(&path).unwrap_err();
        assert!(matches!(err, Error::Taxonomy(_)));

        std::fs::write(&path, "version = ").unwrap();
        match ModelManifest::load(&path).unwrap_err() {
            Error::Manifest { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifact.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(b"abc").unwrap();
        drop(file);

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_shipped_example_manifest() {
        let manifest = ModelManifest::from_toml_str(
            include_str!("../../../models/manifest.example.toml"),
            Path::new("models"),
        )
        .unwrap();
        let registry = manifest.registry().unwrap();

        assert_eq!(registry.len(), 16);
        assert_eq!(registry.resolve(13).unwrap().display_name, "Folha Saudável");
        assert!(registry.resolve(7).unwrap().placeholder);
        assert_eq!(manifest.input.tensor_shape(), [1, 64, 64, 3]);
    }
}
