// ⚠️ Error Taxonomy
// Fatal registry failures, recoverable per-file failures, and row rejections

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// REGISTRY LOAD ERROR (fatal - aborts the run)
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryLoadError {
    #[error("failed to read registry file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {path} is not valid in any supported encoding")]
    Decode { path: PathBuf },

    /// No candidate (encoding, header schema) pair resolved every required column
    #[error("registry file {path} has no recognizable {column} column (tried: {tried})")]
    MissingColumn {
        path: PathBuf,
        column: String,
        tried: String,
    },

    #[error("malformed registry file {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

// ============================================================================
// FILE READ ERROR (per-file - logged and skipped)
// ============================================================================

#[derive(Debug, Error)]
pub enum FileReadError {
    #[error("failed to open {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV in {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path}: expected {expected} columns, header has {found}")]
    SchemaMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

impl FileReadError {
    pub fn path(&self) -> &PathBuf {
        match self {
            FileReadError::Io { path, .. } => path,
            FileReadError::Csv { path, .. } => path,
            FileReadError::SchemaMismatch { path, .. } => path,
        }
    }
}

// ============================================================================
// ROW REJECTION (not an error - an expected per-row outcome)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rejection {
    UnparseableAmount,
    NonPositiveAmount,
    UnknownRegistryId,
    InvalidTaxId,
    UnparseableDate,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::UnparseableAmount => "unparseable_amount",
            Rejection::NonPositiveAmount => "non_positive_amount",
            Rejection::UnknownRegistryId => "unknown_registry_id",
            Rejection::InvalidTaxId => "invalid_tax_id",
            Rejection::UnparseableDate => "unparseable_date",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
