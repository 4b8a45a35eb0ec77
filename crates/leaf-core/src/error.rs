//! Error types shared across the leaf inference workspace.

use std::path::PathBuf;

use thiserror::Error;

use crate::taxonomy::TaxonomyError;

/// Configuration-level errors.
///
/// Everything in here is fatal at startup: a service that fails to build its
/// configuration, manifest or taxonomy must not accept traffic.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable service configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid or unreadable model manifest
    #[error("Manifest error in {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    /// Taxonomy failed validation or does not fit the model
    #[error("Taxonomy error: {0}")]
    Taxonomy(#[from] TaxonomyError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Specialized Result type for configuration and manifest handling.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("threshold out of range".to_string());
        assert_eq!(err.to_string(), "Configuration error: threshold out of range");
    }

    #[test]
    fn test_manifest_error_names_the_file() {
        let err = Error::Manifest {
            path: PathBuf::from("models/manifest.toml"),
            reason: "missing [input]".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Manifest error in models/manifest.toml: missing [input]"
        );
    }

    #[test]
    fn test_taxonomy_error_conversion() {
        let err: Error = TaxonomyError::Empty.into();
        assert!(matches!(err, Error::Taxonomy(TaxonomyError::Empty)));
    }
}
