//! Core types for GridCheck.
//!
//! This crate defines the foundational types shared by the rule engine and
//! the validation pipeline: device payloads, evaluation results, evidence
//! values, pipeline configuration, and the core error type.

pub mod config;
pub mod error;
pub mod evidence;
pub mod payload;
pub mod result;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use evidence::{EvidenceEntry, EvidenceValue};
pub use payload::DevicePayload;
pub use result::EvaluationResult;

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::evidence::{EvidenceEntry, EvidenceValue};
    pub use crate::payload::DevicePayload;
    pub use crate::result::EvaluationResult;
}
