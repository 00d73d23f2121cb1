//! Error types for the editor core

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Normalization did not converge after {iterations} passes")]
    NormalizeDidNotConverge { iterations: usize },
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PathError(pub String);
