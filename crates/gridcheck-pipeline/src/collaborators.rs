//! Collaborator seams at the pipeline boundary.
//!
//! Concrete cloud backends (document stores, analytics stores, blob
//! stores) live outside this crate; the pipeline only sees these traits.
//! In-memory implementations back the integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use gridcheck_core::{DevicePayload, EvaluationResult};
use gridcheck_rules::Rule;

use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};

/// Description of the scheduled job that triggered a run.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    /// Logical scope of the run, e.g. a data-center name.
    pub scope: String,
}

impl Job {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            scope: scope.into(),
        }
    }
}

/// Source of device payloads for a run.
#[async_trait]
pub trait PayloadProducer: Send + Sync {
    async fn produce(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<DevicePayload>>;
}

/// Terminal sink for evaluation results.
///
/// Persistence is best-effort: the pipeline logs and counts failures but
/// never retries or rethrows them.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn bulk_upsert(
        &self,
        results: &[EvaluationResult],
        cancel: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Source of active rules, with a modification timestamp for external
/// caching layers. The pipeline itself only reads `active_rules` once per
/// process.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn active_rules(&self) -> Result<Vec<Rule>>;

    async fn last_modified(&self, scope: &str) -> Result<DateTime<Utc>>;
}

/// Producer over a fixed payload list.
pub struct StaticProducer {
    payloads: Vec<DevicePayload>,
}

impl StaticProducer {
    pub fn new(payloads: Vec<DevicePayload>) -> Self {
        Self { payloads }
    }
}

#[async_trait]
impl PayloadProducer for StaticProducer {
    async fn produce(
        &self,
        _ctx: &ExecutionContext,
        _job: &Job,
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<DevicePayload>> {
        if *cancel.borrow() {
            return Err(PipelineError::Canceled);
        }
        Ok(self.payloads.clone())
    }
}

/// Sink that collects results in memory.
#[derive(Default)]
pub struct MemorySink {
    results: Mutex<Vec<EvaluationResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn results(&self) -> Vec<EvaluationResult> {
        self.results.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.lock().await.is_empty()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn bulk_upsert(
        &self,
        results: &[EvaluationResult],
        _cancel: watch::Receiver<bool>,
    ) -> Result<()> {
        self.results.lock().await.extend_from_slice(results);
        Ok(())
    }
}

/// Rule store over a fixed rule list.
pub struct MemoryRuleStore {
    rules: Vec<Rule>,
    modified_at: DateTime<Utc>,
}

impl MemoryRuleStore {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            modified_at: Utc::now(),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn active_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.clone())
    }

    async fn last_modified(&self, _scope: &str) -> Result<DateTime<Utc>> {
        Ok(self.modified_at)
    }
}
