//! Evaluation outcomes produced by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evidence::EvidenceEntry;

/// Outcome of evaluating one rule against one device payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Device the rule was evaluated against.
    pub device_id: String,
    /// Rule that produced this result.
    pub rule_id: String,
    /// `Some(true)` pass, `Some(false)` fail, `None` when the rule's
    /// applicability filter did not match the payload.
    pub passed: Option<bool>,
    /// Partial-credit score in `[0, 1]`. Exactly `1.0` for a pass.
    pub score: f64,
    /// Per-leaf diagnostics, populated only on failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceEntry>,
    /// Evaluation error captured for this payload, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the evaluation ran.
    pub evaluated_at: DateTime<Utc>,
    /// Correlation id for the pipeline run.
    pub run_id: Uuid,
    /// Correlation id for the scheduled job that started the run.
    pub job_id: Uuid,
}

impl EvaluationResult {
    /// Create a result shell for a `(device, rule)` pair; callers fill in
    /// the outcome fields.
    pub fn new(
        device_id: impl Into<String>,
        rule_id: impl Into<String>,
        run_id: Uuid,
        job_id: Uuid,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            rule_id: rule_id.into(),
            passed: None,
            score: 0.0,
            evidence: Vec::new(),
            error: None,
            evaluated_at: Utc::now(),
            run_id,
            job_id,
        }
    }

    /// Whether the rule's filter matched this payload at all.
    pub fn is_applicable(&self) -> bool {
        self.passed.is_some()
    }
}
