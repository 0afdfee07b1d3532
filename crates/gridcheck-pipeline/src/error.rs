//! Error types for the pipeline crate.

use thiserror::Error;

// Re-export the core error type
pub use gridcheck_core::Error as CoreError;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The head queue stayed full through every retry. Fatal to the run.
    #[error("Offer to stage '{stage}' exhausted {attempts} retries")]
    RetryExhausted { stage: String, attempts: u32 },

    /// The run was canceled before completion.
    #[error("Run canceled")]
    Canceled,

    /// The producer collaborator failed to deliver payloads.
    #[error("Producer error: {0}")]
    Producer(String),

    /// Rule loading failed outright (no rules could be read).
    #[error("Rule store error: {0}")]
    RuleStore(String),

    /// A stage shut down while items were still being offered.
    #[error("Stage '{0}' is closed")]
    StageClosed(String),
}

impl From<PipelineError> for CoreError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Canceled => CoreError::Canceled("pipeline run".to_string()),
            other => CoreError::Pipeline(other.to_string()),
        }
    }
}
