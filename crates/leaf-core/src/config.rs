//! Service configuration.
//!
//! Loaded from a TOML file; every key has a default so an empty file is a
//! valid configuration. Binaries layer command line and environment
//! overrides on top.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::load_toml_config;
use crate::{Error, Result};

/// Top-level configuration for the inference service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Path to the model manifest
    pub manifest: PathBuf,
    /// When the model is loaded
    pub load_policy: LoadPolicy,
    /// Confidence presentation policy
    pub calibration: CalibrationConfig,
    /// Display labels for unresolved predictions
    pub labels: LabelConfig,
    /// Upload limits
    pub upload: UploadConfig,
    /// HTTP server settings
    pub server: ServerConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("models/manifest.toml"),
            load_policy: LoadPolicy::default(),
            calibration: CalibrationConfig::default(),
            labels: LabelConfig::default(),
            upload: UploadConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()
    }

    /// Checks value ranges.
    pub fn validate(self) -> Result<Self> {
        self.calibration.validate()?;
        if self.upload.max_bytes == 0 {
            return Err(Error::Config(
                "upload.max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.upload.allowed_extensions.is_empty() {
            return Err(Error::Config(
                "upload.allowed_extensions must not be empty".to_string(),
            ));
        }
        if self.labels.unidentified.trim().is_empty() {
            return Err(Error::Config(
                "labels.unidentified must not be empty".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Model load timing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// Load before accepting traffic; a failure aborts startup
    Eager,
    /// Load on the first request
    #[default]
    Lazy,
}

impl std::fmt::Display for LoadPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadPolicy::Eager => write!(f, "eager"),
            LoadPolicy::Lazy => write!(f, "lazy"),
        }
    }
}

impl std::str::FromStr for LoadPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eager" => Ok(LoadPolicy::Eager),
            "lazy" => Ok(LoadPolicy::Lazy),
            other => Err(format!("unknown load policy '{other}' (expected eager or lazy)")),
        }
    }
}

/// How raw probabilities are turned into displayed confidences
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStrategy {
    /// Scores below the threshold are remapped into `[threshold, 1]`
    #[default]
    AffineFloor,
    /// Report the raw probability
    Identity,
}

/// Calibration settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationConfig {
    pub strategy: CalibrationStrategy,
    pub threshold: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            strategy: CalibrationStrategy::AffineFloor,
            threshold: 0.65,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Config(format!(
                "calibration.threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Display labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabelConfig {
    /// Shown for placeholder slots and unmapped indices
    pub unidentified: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            unidentified: "Unidentified".to_string(),
        }
    }
}

/// Upload limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Maximum accepted payload in bytes, checked before decoding
    pub max_bytes: usize,
    /// Accepted filename extensions (lowercase, no dot)
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            allowed_extensions: vec!["png".to_string(), "jpg".to_string(), "jpeg".to_string()],
        }
    }
}

impl UploadConfig {
    /// Case-insensitive extension check on an uploaded filename.
    pub fn is_allowed_filename(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Optional directory served at `/` for the web UI
    pub static_dir: Option<PathBuf>,
    /// Allow any origin, method and header
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            static_dir: None,
            cors_permissive: true,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.load_policy, LoadPolicy::Lazy);
        assert_eq!(config.calibration.threshold, 0.65);
        assert_eq!(config.calibration.strategy, CalibrationStrategy::AffineFloor);
        assert_eq!(config.upload.max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.server.port, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config: ServiceConfig = toml::from_str(
            r#"
load_policy = "eager"

[calibration]
strategy = "identity"

[server]
port = 8080
"#,
        )
        .unwrap();
        assert_eq!(config.load_policy, LoadPolicy::Eager);
        assert_eq!(config.calibration.strategy, CalibrationStrategy::Identity);
        assert_eq!(config.calibration.threshold, 0.65);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_threshold_range() {
        let mut config = ServiceConfig::default();
        config.calibration.threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_upload_limit_rejected() {
        let mut config = ServiceConfig::default();
        config.upload.max_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_filename() {
        let upload = UploadConfig::default();
        assert!(upload.is_allowed_filename("folha.JPG"));
        assert!(upload.is_allowed_filename("folha.png"));
        assert!(!upload.is_allowed_filename("folha.gif"));
        assert!(!upload.is_allowed_filename("folha"));
    }

    #[test]
    fn test_load_policy_from_str() {
        assert_eq!("EAGER".parse::<LoadPolicy>(), Ok(LoadPolicy::Eager));
        assert!("sometimes".parse::<LoadPolicy>().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("leaf.toml");
        std::fs::write(&path, "[labels]\nunidentified = \"Não Identificado\"\n").unwrap();
        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.labels.unidentified, "Não Identificado");

        std::fs::write(&path, "[calibration]\nthreshold = -0.1\n").unwrap();
        assert!(ServiceConfig::load(&path).is_err());
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let text = include_str!("../../../config/leaf.toml");
        let config: ServiceConfig = toml::from_str(text).unwrap();
        assert_eq!(config.validate().unwrap(), ServiceConfig::default());
    }
}
