//! Pipeline orchestrator: wires the stages, moves payloads in, and waits
//! the run out.
//!
//! Stage graph: produce → [optional broadcast] → evaluate → batch →
//! persist. The orchestrator owns the only fatal backpressure decision:
//! when the head queue stays full through every retry, the run aborts.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use gridcheck_core::{DevicePayload, EvaluationResult, PipelineConfig};

use crate::collaborators::{Job, PayloadProducer, ResultSink};
use crate::context::{ContextSnapshot, ExecutionContext};
use crate::error::{PipelineError, Result};
use crate::stage::{
    spawn_action, spawn_batch, spawn_broadcast, spawn_transform, ActionFn, BroadcastMode,
    OfferError, StageHandle, TransformFn,
};
use crate::transform::RuleEvaluationTransform;

/// Runs the validation pipeline for one job at a time.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    producer: Arc<dyn PayloadProducer>,
    lanes: Vec<Arc<RuleEvaluationTransform>>,
    broadcast: Option<BroadcastMode<DevicePayload>>,
    sink: Arc<dyn ResultSink>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        producer: Arc<dyn PayloadProducer>,
        transform: Arc<RuleEvaluationTransform>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            producer,
            lanes: vec![transform],
            broadcast: None,
            sink,
        }
    }

    /// Replace the single evaluation lane with several, fed by a
    /// broadcast stage. `BroadcastMode::All` copies every payload to
    /// every lane; `Route` sends each payload to exactly one.
    pub fn with_broadcast(
        mut self,
        lanes: Vec<Arc<RuleEvaluationTransform>>,
        mode: BroadcastMode<DevicePayload>,
    ) -> Self {
        self.lanes = lanes;
        self.broadcast = Some(mode);
        self
    }

    /// Execute one full run and return its counter snapshot.
    ///
    /// Flip the cancel watch to `true` to stop the run; in-flight items
    /// may still be processed, but no new retries are attempted and the
    /// run returns [`PipelineError::Canceled`].
    pub async fn run(&self, job: Job, cancel: watch::Receiver<bool>) -> Result<ContextSnapshot> {
        let ctx = Arc::new(ExecutionContext::new(job.job_id));
        info!(run_id = %ctx.run_id, job_id = %job.job_id, scope = %job.scope, "run starting");

        // Surface rule-store failures before any payload moves.
        for lane in &self.lanes {
            lane.compiled_rules().await?;
        }

        let sink_stage = self.spawn_sink(&ctx, &cancel);
        let batch_stage = spawn_batch(
            "batch",
            self.config.bounded_capacity,
            self.config.batch_size,
            self.config.batch_window,
            cancel.clone(),
            Arc::clone(&sink_stage),
            self.config.propagate_completion,
        );
        // Evaluation lanes share the batch queue, so the orchestrator
        // closes it itself once every lane has drained.
        let eval_stages: Vec<Arc<StageHandle<DevicePayload>>> = self
            .lanes
            .iter()
            .map(|lane| self.spawn_eval(lane, &ctx, &batch_stage, &cancel))
            .collect();

        let head: Arc<StageHandle<DevicePayload>> =
            if eval_stages.len() == 1 && self.broadcast.is_none() {
                Arc::clone(&eval_stages[0])
            } else {
                let mode = self.broadcast.clone().unwrap_or(BroadcastMode::All);
                spawn_broadcast(
                    "fanout",
                    self.config.bounded_capacity,
                    cancel.clone(),
                    mode,
                    eval_stages.clone(),
                    true,
                )
            };

        let payloads = self.producer.produce(&ctx, &job, cancel.clone()).await?;
        info!(run_id = %ctx.run_id, payloads = payloads.len(), "payloads produced");

        for payload in payloads {
            self.offer_with_retry(&head, payload, &ctx, &cancel).await?;
        }
        head.complete().await;

        wait_or_cancel(&head, &cancel).await?;
        for stage in &eval_stages {
            wait_or_cancel(stage, &cancel).await?;
        }
        batch_stage.complete().await;
        wait_or_cancel(&batch_stage, &cancel).await?;
        if !self.config.propagate_completion {
            sink_stage.complete().await;
        }
        wait_or_cancel(&sink_stage, &cancel).await?;

        let snapshot = ctx.snapshot();
        info!(
            run_id = %ctx.run_id,
            elapsed_ms = snapshot.elapsed_ms,
            sent = snapshot.total_sent,
            received = snapshot.total_received,
            filtered = snapshot.total_filtered,
            evaluated = snapshot.total_evaluated,
            saved = snapshot.total_saved,
            failed = snapshot.total_failed,
            "run complete"
        );
        Ok(snapshot)
    }

    fn spawn_eval(
        &self,
        lane: &Arc<RuleEvaluationTransform>,
        ctx: &Arc<ExecutionContext>,
        downstream: &Arc<StageHandle<EvaluationResult>>,
        cancel: &watch::Receiver<bool>,
    ) -> Arc<StageHandle<DevicePayload>> {
        let lane = Arc::clone(lane);
        let ctx = Arc::clone(ctx);
        let func: TransformFn<DevicePayload, EvaluationResult> = Arc::new(move |payload| {
            let lane = Arc::clone(&lane);
            let ctx = Arc::clone(&ctx);
            Box::pin(async move {
                match lane.evaluate(&payload, &ctx).await {
                    Ok(results) => results,
                    Err(e) => {
                        warn!(device_id = %payload.device_id, error = %e,
                              "evaluation produced no results");
                        Vec::new()
                    }
                }
            })
        });
        spawn_transform(
            "evaluate",
            self.config.bounded_capacity,
            self.config.max_parallelism,
            cancel.clone(),
            func,
            Arc::clone(downstream),
            false,
        )
    }

    fn spawn_sink(
        &self,
        ctx: &Arc<ExecutionContext>,
        cancel: &watch::Receiver<bool>,
    ) -> Arc<StageHandle<Vec<EvaluationResult>>> {
        let sink = Arc::clone(&self.sink);
        let ctx = Arc::clone(ctx);
        let action_cancel = cancel.clone();
        let func: ActionFn<Vec<EvaluationResult>> = Arc::new(move |batch| {
            let sink = Arc::clone(&sink);
            let ctx = Arc::clone(&ctx);
            let cancel = action_cancel.clone();
            Box::pin(async move {
                let count = batch.len() as u64;
                // Persistence is best-effort: count the outcome either way.
                match sink.bulk_upsert(&batch, cancel).await {
                    Ok(()) => ctx.add_saved(count),
                    Err(e) => {
                        warn!(batch = count, error = %e, "batch persist failed");
                        ctx.add_failed(count);
                    }
                }
            })
        });
        spawn_action(
            "persist",
            self.config.bounded_capacity,
            self.config.max_parallelism,
            cancel.clone(),
            func,
        )
    }

    /// Offer one payload to the head stage, retrying on a full queue.
    async fn offer_with_retry(
        &self,
        head: &Arc<StageHandle<DevicePayload>>,
        mut payload: DevicePayload,
        ctx: &ExecutionContext,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            if *cancel.borrow() {
                return Err(PipelineError::Canceled);
            }
            match head.offer(payload).await {
                Ok(()) => {
                    ctx.inc_sent();
                    return Ok(());
                }
                Err(OfferError::Full(back)) => {
                    attempts += 1;
                    if attempts >= self.config.max_retry_count {
                        return Err(PipelineError::RetryExhausted {
                            stage: head.name().to_string(),
                            attempts,
                        });
                    }
                    payload = back;
                    tokio::time::sleep(self.config.wait_span).await;
                }
                Err(OfferError::Closed) => {
                    return Err(PipelineError::StageClosed(head.name().to_string()));
                }
            }
        }
    }
}

/// Wait for a stage to drain, bailing out when the run is canceled.
async fn wait_or_cancel<T>(
    stage: &Arc<StageHandle<T>>,
    cancel: &watch::Receiver<bool>,
) -> Result<()> {
    let mut cancel = cancel.clone();
    tokio::select! {
        _ = stage.wait_complete() => Ok(()),
        _ = async {
            loop {
                if *cancel.borrow() {
                    return;
                }
                if cancel.changed().await.is_err() {
                    // Sender gone; cancellation can never fire.
                    std::future::pending::<()>().await;
                }
            }
        } => Err(PipelineError::Canceled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::collaborators::{MemoryRuleStore, MemorySink, StaticProducer};
    use gridcheck_rules::{MacroRegistry, Rule};

    fn simple_rule() -> Rule {
        serde_json::from_value(json!({
            "id": "r1", "name": "status online",
            "if": { "left": "Status", "operator": "equals", "right": "online" }
        }))
        .unwrap()
    }

    fn payloads(n: usize) -> Vec<DevicePayload> {
        (0..n)
            .map(|i| DevicePayload::new(format!("dev-{i}"), "ups", json!({ "Status": "online" })))
            .collect()
    }

    fn transform() -> Arc<RuleEvaluationTransform> {
        Arc::new(RuleEvaluationTransform::new(
            Arc::new(MemoryRuleStore::new(vec![simple_rule()])),
            Arc::new(MacroRegistry::new()),
        ))
    }

    struct StuckSink;

    #[async_trait]
    impl ResultSink for StuckSink {
        async fn bulk_upsert(
            &self,
            _results: &[EvaluationResult],
            _cancel: watch::Receiver<bool>,
        ) -> Result<()> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_canceled_before_start() {
        let sink = Arc::new(MemorySink::new());
        let orchestrator = PipelineOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(StaticProducer::new(payloads(3))),
            transform(),
            sink,
        );
        let (tx, rx) = watch::channel(true);
        let err = orchestrator.run(Job::new("dc-1"), rx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Canceled));
        drop(tx);
    }

    #[tokio::test]
    async fn test_retry_exhausted_when_pipeline_is_stuck() {
        let config = PipelineConfig {
            max_parallelism: 1,
            bounded_capacity: 1,
            batch_size: 1,
            batch_window: Duration::from_millis(10),
            max_retry_count: 3,
            wait_span: Duration::from_millis(10),
            propagate_completion: true,
        };
        let orchestrator = PipelineOrchestrator::new(
            config,
            Arc::new(StaticProducer::new(payloads(64))),
            transform(),
            Arc::new(StuckSink),
        );
        let (tx, rx) = watch::channel(false);
        let err = orchestrator.run(Job::new("dc-1"), rx).await.unwrap_err();
        assert!(matches!(err, PipelineError::RetryExhausted { attempts: 3, .. }));
        drop(tx);
    }

    #[tokio::test]
    async fn test_rule_store_failure_is_fatal() {
        struct BrokenStore;

        #[async_trait]
        impl crate::collaborators::RuleStore for BrokenStore {
            async fn active_rules(&self) -> Result<Vec<Rule>> {
                Err(PipelineError::RuleStore("unreachable".to_string()))
            }

            async fn last_modified(
                &self,
                _scope: &str,
            ) -> Result<chrono::DateTime<chrono::Utc>> {
                Ok(chrono::Utc::now())
            }
        }

        let transform = Arc::new(RuleEvaluationTransform::new(
            Arc::new(BrokenStore),
            Arc::new(MacroRegistry::new()),
        ));
        let orchestrator = PipelineOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(StaticProducer::new(payloads(1))),
            transform,
            Arc::new(MemorySink::new()),
        );
        let (tx, rx) = watch::channel(false);
        let err = orchestrator.run(Job::new("dc-1"), rx).await.unwrap_err();
        assert!(matches!(err, PipelineError::RuleStore(_)));
        drop(tx);
    }
}
