//! The rule evaluation transform: one device payload in, one evaluation
//! result out per applicable rule.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use gridcheck_core::{DevicePayload, EvaluationResult, EvidenceEntry};
use gridcheck_rules::compiler::{CompiledRule, ConditionCompiler};
use gridcheck_rules::functions::MacroRegistry;

use crate::collaborators::RuleStore;
use crate::context::ExecutionContext;
use crate::error::{PipelineError, Result};

/// Evaluates every active rule against each payload.
///
/// Rules are loaded and compiled once, on first use, and shared by all
/// workers for the lifetime of the transform. A rule whose assertion fails
/// to compile is skipped with a warning; it never blocks the others.
pub struct RuleEvaluationTransform {
    store: Arc<dyn RuleStore>,
    compiler: ConditionCompiler,
    compiled: RwLock<Option<Arc<Vec<CompiledRule>>>>,
}

impl RuleEvaluationTransform {
    pub fn new(store: Arc<dyn RuleStore>, registry: Arc<MacroRegistry>) -> Self {
        Self {
            store,
            compiler: ConditionCompiler::new(registry),
            compiled: RwLock::new(None),
        }
    }

    /// Load and compile the active rules, caching the result.
    ///
    /// Double-checked under the write lock so concurrent first calls
    /// compile only once. A store failure is returned to the caller; a
    /// single uncompilable rule is not.
    pub async fn compiled_rules(&self) -> Result<Arc<Vec<CompiledRule>>> {
        if let Some(rules) = self.compiled.read().await.as_ref() {
            return Ok(Arc::clone(rules));
        }
        let mut slot = self.compiled.write().await;
        if let Some(rules) = slot.as_ref() {
            return Ok(Arc::clone(rules));
        }

        let rules = self
            .store
            .active_rules()
            .await
            .map_err(|e| PipelineError::RuleStore(e.to_string()))?;
        let total = rules.len();
        let compiled: Vec<CompiledRule> = rules
            .iter()
            .filter_map(|rule| match self.compiler.compile_rule(rule) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "rule failed to compile, skipping");
                    None
                }
            })
            .collect();
        debug!(compiled = compiled.len(), total, "rule set compiled");

        let compiled = Arc::new(compiled);
        *slot = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Evaluate all compiled rules against one payload.
    ///
    /// Filtered-out `(payload, rule)` pairs are counted but produce no
    /// result. An evaluation error on one rule is captured in that rule's
    /// result and never aborts the payload.
    pub async fn evaluate(
        &self,
        payload: &DevicePayload,
        ctx: &ExecutionContext,
    ) -> Result<Vec<EvaluationResult>> {
        let rules = self.compiled_rules().await?;
        ctx.inc_received();

        let mut results = Vec::new();
        for rule in rules.iter() {
            let mut result =
                EvaluationResult::new(&payload.device_id, &rule.rule_id, ctx.run_id, ctx.job_id);

            match (rule.filter)(payload) {
                Ok(false) => {
                    ctx.inc_filtered();
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    warn!(device_id = %payload.device_id, rule_id = %rule.rule_id,
                          error = %e, "filter evaluation failed");
                    result.error = Some(e.to_string());
                    ctx.add_failed(1);
                    results.push(result);
                    continue;
                }
            }

            match (rule.assert)(payload) {
                Ok(true) => {
                    result.passed = Some(true);
                    result.score = 1.0;
                    ctx.inc_evaluated();
                }
                Ok(false) => {
                    result.passed = Some(false);
                    result.evidence = Self::collect_evidence(rule, payload);
                    result.score = Self::aggregate_score(&result.evidence);
                    ctx.inc_evaluated();
                }
                Err(e) => {
                    warn!(device_id = %payload.device_id, rule_id = %rule.rule_id,
                          error = %e, "rule evaluation failed");
                    result.error = Some(e.to_string());
                    ctx.add_failed(1);
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Per-leaf diagnostics for a failed rule, in stable path order.
    fn collect_evidence(rule: &CompiledRule, payload: &DevicePayload) -> Vec<EvidenceEntry> {
        let mut paths: Vec<&String> = rule.scorers.keys().collect();
        paths.sort();
        paths
            .into_iter()
            .map(|path| {
                let score = rule.scorers[path](payload);
                let actual = rule.evidence[path](payload);
                let expected = rule.expectation[path](payload);
                EvidenceEntry {
                    property_path: path.clone(),
                    expected,
                    actual,
                    score,
                }
            })
            .collect()
    }

    /// Mean of the leaf scores. Leaf scorers already cap unsatisfied
    /// leaves below 1.0, so a failed rule never averages to a pass.
    fn aggregate_score(evidence: &[EvidenceEntry]) -> f64 {
        if evidence.is_empty() {
            return 0.0;
        }
        let sum: f64 = evidence.iter().map(|e| e.score).sum();
        (sum / evidence.len() as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    use crate::collaborators::MemoryRuleStore;
    use gridcheck_rules::Rule;

    fn rule(value: serde_json::Value) -> Rule {
        serde_json::from_value(value).unwrap()
    }

    fn transform(rules: Vec<Rule>) -> RuleEvaluationTransform {
        RuleEvaluationTransform::new(
            Arc::new(MemoryRuleStore::new(rules)),
            Arc::new(MacroRegistry::new()),
        )
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_pass_scores_one() {
        let transform = transform(vec![rule(json!({
            "id": "r1", "name": "status online",
            "if": { "left": "Status", "operator": "equals", "right": "online" }
        }))]);
        let ctx = ctx();
        let payload = DevicePayload::new("dev-1", "ups", json!({ "Status": "online" }));

        let results = transform.evaluate(&payload, &ctx).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].passed, Some(true));
        assert_eq!(results[0].score, 1.0);
        assert!(results[0].evidence.is_empty());
        assert_eq!(ctx.total_evaluated(), 1);
    }

    #[tokio::test]
    async fn test_failure_carries_evidence_and_partial_score() {
        let transform = transform(vec![rule(json!({
            "id": "r1", "name": "load under limit",
            "if": { "left": "LoadPct", "operator": "lessThanOrEqual", "right": 50 }
        }))]);
        let payload = DevicePayload::new("dev-1", "ups", json!({ "LoadPct": 62 }));

        let results = transform.evaluate(&payload, &ctx()).await.unwrap();
        assert_eq!(results[0].passed, Some(false));
        assert!(results[0].score > 0.0 && results[0].score < 1.0);
        assert_eq!(results[0].evidence.len(), 1);
        assert_eq!(results[0].evidence[0].property_path, "LoadPct");
        assert_eq!(results[0].evidence[0].actual.render(), "62");
        assert_eq!(results[0].evidence[0].expected.render(), "50");
    }

    #[tokio::test]
    async fn test_filtered_pair_produces_no_result() {
        let transform = transform(vec![rule(json!({
            "id": "r1", "name": "ups only",
            "when": { "left": "Kind", "operator": "equals", "right": "ups" },
            "if": { "left": "Status", "operator": "equals", "right": "online" }
        }))]);
        let ctx = ctx();
        let payload = DevicePayload::new("dev-1", "crah", json!({ "Kind": "crah" }));

        let results = transform.evaluate(&payload, &ctx).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(ctx.total_filtered(), 1);
        assert_eq!(ctx.total_evaluated(), 0);
    }

    #[tokio::test]
    async fn test_uncompilable_rule_is_skipped() {
        let transform = transform(vec![
            rule(json!({
                "id": "bad", "name": "bad assert",
                "if": { "left": "A.Frobnicate()", "operator": "equals", "right": 1 }
            })),
            rule(json!({
                "id": "good", "name": "good",
                "if": { "left": "A", "operator": "equals", "right": 1 }
            })),
        ]);
        let payload = DevicePayload::new("dev-1", "ups", json!({ "A": 1 }));

        let results = transform.evaluate(&payload, &ctx()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule_id, "good");
    }

    #[tokio::test]
    async fn test_evaluation_error_captured_per_rule() {
        // Sum over a non-numeric element fails at evaluation time.
        let transform = transform(vec![
            rule(json!({
                "id": "erring", "name": "sum of mixed",
                "if": { "left": "Readings.Sum()", "operator": "greaterThan", "right": 0 }
            })),
            rule(json!({
                "id": "fine", "name": "fine",
                "if": { "left": "Status", "operator": "equals", "right": "online" }
            })),
        ]);
        let ctx = ctx();
        let payload = DevicePayload::new(
            "dev-1",
            "ups",
            json!({ "Readings": [1, "x"], "Status": "online" }),
        );

        let results = transform.evaluate(&payload, &ctx).await.unwrap();
        assert_eq!(results.len(), 2);
        let erring = results.iter().find(|r| r.rule_id == "erring").unwrap();
        assert!(erring.error.is_some());
        assert_eq!(erring.passed, None);
        let fine = results.iter().find(|r| r.rule_id == "fine").unwrap();
        assert_eq!(fine.passed, Some(true));
        assert_eq!(ctx.total_failed(), 1);
        assert_eq!(ctx.total_evaluated(), 1);
    }

    #[tokio::test]
    async fn test_rules_compiled_once() {
        let transform = transform(vec![rule(json!({
            "id": "r1", "name": "r1",
            "if": { "left": "A", "operator": "equals", "right": 1 }
        }))]);
        let first = transform.compiled_rules().await.unwrap();
        let second = transform.compiled_rules().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
