use std::path::PathBuf;

use thiserror::Error;

/// Failure modes of the mapping pipeline. Config and reconciliation
/// errors abort before any work starts; worker errors abort the run but
/// leave already-written per-chunk outputs on disk.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing input: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("malformed matrix: {0}")]
    MalformedMatrix(String),

    #[error("inconsistent inputs: {0}")]
    InconsistentInputs(String),

    /// A pair with no cells on one side has no estimable moments. It
    /// contributes no markers but does not abort the run; the scorer
    /// surfaces a summary through the log instead of raising this.
    #[error("numeric degeneracy: {0}")]
    NumericDegeneracy(String),

    #[error("no gene overlap between query data and reference markers")]
    EmptyVocabulary,

    #[error("invalid taxonomy: {0}")]
    InvalidTaxonomy(String),

    #[error("worker failure: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, MapperError>;
