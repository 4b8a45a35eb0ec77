//! Class taxonomy and its registry.
//!
//! A taxonomy maps each position of the classifier's output vector to a
//! stable disease identifier and a display label. The order is fixed by the
//! training run that produced the artifact, so a taxonomy is only ever used
//! together with the artifact hash recorded next to it in the manifest.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while building or querying a taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaxonomyError {
    /// Index past the end of the taxonomy
    #[error("class index {index} is outside the taxonomy ({len} classes)")]
    UnknownClassIndex { index: usize, len: usize },

    /// Taxonomy length differs from the model's output width
    #[error(
        "taxonomy '{version}' has {taxonomy_len} classes but the model outputs {model_output_width}"
    )]
    IncompatibleTaxonomy {
        version: String,
        taxonomy_len: usize,
        model_output_width: usize,
    },

    /// No classes at all
    #[error("taxonomy has no classes")]
    Empty,

    /// Indices must run 0, 1, 2, ... without gaps
    #[error("class indices must be contiguous from 0: expected {expected}, found {found}")]
    NonContiguousIndex { expected: usize, found: usize },

    /// Same index listed twice
    #[error("class index {0} is listed more than once")]
    DuplicateIndex(usize),

    /// Same identifier listed twice
    #[error("class id '{0}' is listed more than once")]
    DuplicateId(String),

    /// Blank identifier
    #[error("class at index {0} has an empty id")]
    EmptyId(usize),
}

/// One slot of the classifier output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    /// Position in the output vector
    pub index: usize,
    /// Stable snake_case identifier (e.g. "ferrugem_asiatica")
    pub id: String,
    /// Human-readable label
    pub display_name: String,
    /// Unassigned slot kept only so the indices line up with the model
    #[serde(default)]
    pub placeholder: bool,
}

impl ClassEntry {
    /// Creates an entry whose display name is derived from the id.
    pub fn new(index: usize, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            index,
            display_name: derive_display_name(&id),
            id,
            placeholder: false,
        }
    }

    /// Creates an entry with an explicit display name.
    pub fn with_display_name(
        index: usize,
        id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            index,
            id: id.into(),
            display_name: display_name.into(),
            placeholder: false,
        }
    }

    /// Creates a placeholder entry for an unassigned output slot.
    pub fn placeholder(index: usize, id: impl Into<String>) -> Self {
        Self {
            placeholder: true,
            ..Self::new(index, id)
        }
    }
}

/// Turns `mancha_olho_de_ra` into `Mancha Olho De Ra`.
pub fn derive_display_name(id: &str) -> String {
    id.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ordered, validated list of class entries. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassTaxonomy {
    entries: Vec<ClassEntry>,
}

impl ClassTaxonomy {
    /// Validates and orders the entries.
    ///
    /// Entries may arrive in any order; after sorting by index they must
    /// cover exactly `0..len` with unique, non-empty ids.
    pub fn new(mut entries: Vec<ClassEntry>) -> Result<Self, TaxonomyError> {
        if entries.is_empty() {
            return Err(TaxonomyError::Empty);
        }

        entries.sort_by_key(|entry| entry.index);

        let mut seen_ids = HashSet::with_capacity(entries.len());
        for (expected, entry) in entries.iter().enumerate() {
            if entry.index < expected {
                return Err(TaxonomyError::DuplicateIndex(entry.index));
            }
            if entry.index != expected {
                return Err(TaxonomyError::NonContiguousIndex {
                    expected,
                    found: entry.index,
                });
            }
            if entry.id.trim().is_empty() {
                return Err(TaxonomyError::EmptyId(entry.index));
            }
            if !seen_ids.insert(entry.id.as_str()) {
                return Err(TaxonomyError::DuplicateId(entry.id.clone()));
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ClassEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[ClassEntry] {
        &self.entries
    }

    /// Finds an entry by its identifier.
    pub fn find_id(&self, id: &str) -> Option<&ClassEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }
}

/// Taxonomy bound to one model artifact.
///
/// Constructed once at startup from the manifest and shared read-only
/// between requests.
#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyRegistry {
    version: String,
    model_sha256: String,
    taxonomy: ClassTaxonomy,
}

impl TaxonomyRegistry {
    pub fn new(
        version: impl Into<String>,
        model_sha256: impl Into<String>,
        taxonomy: ClassTaxonomy,
    ) -> Self {
        Self {
            version: version.into(),
            model_sha256: model_sha256.into(),
            taxonomy,
        }
    }

    /// Maps an output index to its class entry.
    pub fn resolve(&self, index: usize) -> Result<&ClassEntry, TaxonomyError> {
        self.taxonomy
            .get(index)
            .ok_or(TaxonomyError::UnknownClassIndex {
                index,
                len: self.taxonomy.len(),
            })
    }

    /// Checks the taxonomy against a model's output width.
    ///
    /// A width match is required but not sufficient: the manifest also pins
    /// the artifact digest, which the loader verifies.
    pub fn bind(&self, model_output_width: usize) -> Result<&ClassTaxonomy, TaxonomyError> {
        if self.taxonomy.len() == model_output_width {
            Ok(&self.taxonomy)
        } else {
            Err(TaxonomyError::IncompatibleTaxonomy {
                version: self.version.clone(),
                taxonomy_len: self.taxonomy.len(),
                model_output_width,
            })
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Digest of the artifact this taxonomy was trained with.
    pub fn model_sha256(&self) -> &str {
        &self.model_sha256
    }

    pub fn taxonomy(&self) -> &ClassTaxonomy {
        &self.taxonomy
    }

    pub fn len(&self) -> usize {
        self.taxonomy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxonomy.is_empty()
    }
}
