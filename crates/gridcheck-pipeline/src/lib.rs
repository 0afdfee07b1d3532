//! Concurrent validation pipeline for GridCheck.
//!
//! Device payloads stream through bounded, parallel stages:
//! produce → (optional broadcast) → transform → batch → persist.
//! Every stage is a bounded queue plus a fixed worker pool; backpressure
//! comes from the queue bound, and the orchestrator's offer/retry loop is
//! the only place that converts sustained backpressure into a run abort.

pub mod collaborators;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod stage;
pub mod transform;

pub use collaborators::{Job, PayloadProducer, ResultSink, RuleStore};
pub use context::{ContextSnapshot, ExecutionContext};
pub use error::{PipelineError, Result};
pub use orchestrator::PipelineOrchestrator;
pub use stage::{BroadcastMode, OfferError, StageHandle};
pub use transform::RuleEvaluationTransform;
