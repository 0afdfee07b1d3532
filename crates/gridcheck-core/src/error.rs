//! Error types shared across the GridCheck workspace.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Member crates define their own error enums and convert into this type
/// at the crate boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// Rule DSL parse, path resolution, or compilation failure.
    #[error("Rule error: {0}")]
    Rule(String),

    /// Pipeline flow-control failure.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The run was canceled before completion.
    #[error("Canceled: {0}")]
    Canceled(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
