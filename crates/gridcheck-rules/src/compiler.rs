//! Condition compiler.
//!
//! Turns a [`ConditionExpression`] tree into a reusable predicate over
//! device payloads. Compilation resolves and validates every property path
//! up front; the returned closures are evaluated against many payloads
//! without re-parsing.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use gridcheck_core::{DevicePayload, EvidenceValue};

use crate::error::{Result, RuleError};
use crate::functions::{eval_path, FunctionName, MacroRegistry};
use crate::model::{ConditionExpression, LeafCondition, Rule};
use crate::operators::Operator;
use crate::path::{PathResolver, Segment};
use crate::scoring;

/// Reusable compiled predicate.
pub type Predicate = Arc<dyn Fn(&DevicePayload) -> Result<bool> + Send + Sync>;

/// Extracts one operand value from a payload for diagnostics.
pub type Extractor = Arc<dyn Fn(&DevicePayload) -> EvidenceValue + Send + Sync>;

/// Partial-credit score function; infallible, errors score 0.
pub type ScoreFn = Arc<dyn Fn(&DevicePayload) -> f64 + Send + Sync>;

/// Right-hand operand of a compiled leaf.
#[derive(Clone)]
pub(crate) enum Operand {
    Literal(Value),
    Program(Arc<Vec<Segment>>),
}

/// A leaf condition with both operands resolved to executable form.
#[derive(Clone)]
pub(crate) struct CompiledLeaf {
    pub left_path: String,
    pub left: Arc<Vec<Segment>>,
    pub operator: Operator,
    pub operand: Operand,
    pub args: Arc<Vec<String>>,
    pub registry: Arc<MacroRegistry>,
}

impl CompiledLeaf {
    /// Resolve the left operand on a payload.
    pub fn left_value(&self, payload: &DevicePayload) -> Result<Value> {
        eval_path(&self.left, &payload.data, &payload.asset_kind, &self.registry)
    }

    /// Resolve the right operand on a payload.
    pub fn right_value(&self, payload: &DevicePayload) -> Result<Value> {
        match &self.operand {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Program(program) => {
                eval_path(program, &payload.data, &payload.asset_kind, &self.registry)
            }
        }
    }

    /// Evaluate the comparison itself.
    pub fn apply(&self, payload: &DevicePayload) -> Result<bool> {
        let left = self.left_value(payload)?;
        let right = self.right_value(payload)?;
        self.operator.apply(&left, &right, &self.args)
    }
}

/// A rule compiled down to predicates and per-leaf diagnostics, cached by
/// rule id for the lifetime of the process.
#[derive(Clone)]
pub struct CompiledRule {
    pub rule_id: String,
    /// Applicability filter (`when`); always-true when the rule has none.
    pub filter: Predicate,
    /// The assertion (`if`).
    pub assert: Predicate,
    /// Actual-value extractors keyed by leaf path.
    pub evidence: HashMap<String, Extractor>,
    /// Expected-value extractors keyed by leaf path.
    pub expectation: HashMap<String, Extractor>,
    /// Partial-credit scorers keyed by leaf path.
    pub scorers: HashMap<String, ScoreFn>,
}

/// Compiles condition trees against a shared macro registry.
pub struct ConditionCompiler {
    registry: Arc<MacroRegistry>,
}

impl ConditionCompiler {
    pub fn new(registry: Arc<MacroRegistry>) -> Self {
        Self { registry }
    }

    /// Compile a condition tree into a predicate.
    pub fn compile(&self, expr: &ConditionExpression) -> Result<Predicate> {
        match expr {
            ConditionExpression::Leaf(leaf) => {
                let compiled = self.compile_leaf(leaf)?;
                Ok(Arc::new(move |payload| compiled.apply(payload)))
            }
            ConditionExpression::Not { not } => {
                let inner = self.compile(not)?;
                Ok(Arc::new(move |payload| inner(payload).map(|r| !r)))
            }
            ConditionExpression::AllOf { all_of } => {
                self.compile_aggregate(all_of, true)
            }
            ConditionExpression::AnyOf { any_of } => {
                self.compile_aggregate(any_of, false)
            }
        }
    }

    /// Short-circuit fold over children. A single child compiles to that
    /// child's predicate; empty children are a format error.
    fn compile_aggregate(
        &self,
        children: &[ConditionExpression],
        all: bool,
    ) -> Result<Predicate> {
        if children.is_empty() {
            return Err(RuleError::Format(format!(
                "{} requires at least one child",
                if all { "allOf" } else { "anyOf" }
            )));
        }
        let mut compiled: Vec<Predicate> = children
            .iter()
            .map(|child| self.compile(child))
            .collect::<Result<_>>()?;
        if compiled.len() == 1 {
            return Ok(compiled.pop().unwrap());
        }
        Ok(Arc::new(move |payload| {
            for predicate in &compiled {
                let hit = predicate(payload)?;
                if all && !hit {
                    return Ok(false);
                }
                if !all && hit {
                    return Ok(true);
                }
            }
            Ok(all)
        }))
    }

    /// Compile a whole rule: filter, assertion, and per-leaf diagnostics.
    ///
    /// A failing `if` expression is a hard error carrying the rule id. A
    /// failing `when` filter degrades to always-true so the rule still
    /// runs against every payload. A leaf with no partial-credit function
    /// gets a zero scorer.
    pub fn compile_rule(&self, rule: &Rule) -> Result<CompiledRule> {
        let assert = self.compile(&rule.assert).map_err(|e| RuleError::Compile {
            rule_id: rule.id.clone(),
            reason: e.to_string(),
        })?;

        let filter: Predicate = match &rule.when {
            Some(when) => match self.compile(when) {
                Ok(predicate) => predicate,
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e,
                          "when filter failed to compile, falling back to always-true");
                    Arc::new(|_| Ok(true))
                }
            },
            None => Arc::new(|_| Ok(true)),
        };

        let mut evidence = HashMap::new();
        let mut expectation = HashMap::new();
        let mut scorers = HashMap::new();
        for leaf in rule.assert.leaves() {
            let compiled = self.compile_leaf(leaf).map_err(|e| RuleError::Compile {
                rule_id: rule.id.clone(),
                reason: e.to_string(),
            })?;
            evidence.insert(leaf.left.clone(), scoring::evidence_fn(compiled.clone()));
            expectation.insert(leaf.left.clone(), scoring::expectation_fn(compiled.clone()));
            let scorer: ScoreFn = match scoring::score_fn(compiled) {
                Ok(scorer) => scorer,
                Err(e @ RuleError::UnsupportedScoring { .. }) => {
                    warn!(rule_id = %rule.id, leaf = %leaf.left, error = %e,
                          "no partial-credit function, leaf scores 0");
                    Arc::new(|_: &DevicePayload| 0.0)
                }
                Err(e) => {
                    return Err(RuleError::Compile {
                        rule_id: rule.id.clone(),
                        reason: e.to_string(),
                    })
                }
            };
            scorers.insert(leaf.left.clone(), scorer);
        }

        Ok(CompiledRule {
            rule_id: rule.id.clone(),
            filter,
            assert,
            evidence,
            expectation,
            scorers,
        })
    }

    pub(crate) fn compile_leaf(&self, leaf: &LeafCondition) -> Result<CompiledLeaf> {
        let left = self.parse_program(&leaf.left)?;

        let operand = if leaf.right_side_is_expression {
            let path = leaf.right.as_str().ok_or_else(|| {
                RuleError::Format(
                    "rightSideIsExpression requires 'right' to be a path string".to_string(),
                )
            })?;
            Operand::Program(Arc::new(self.parse_program(path)?))
        } else {
            Operand::Literal(self.parse_literal(leaf)?)
        };

        Ok(CompiledLeaf {
            left_path: leaf.left.clone(),
            left: Arc::new(left),
            operator: leaf.operator,
            operand,
            args: Arc::new(leaf.operator_args.clone()),
            registry: Arc::clone(&self.registry),
        })
    }

    /// Parse a path and validate every segment against the function table
    /// and macro registry, so unresolvable segments fail at compile time.
    fn parse_program(&self, path: &str) -> Result<Vec<Segment>> {
        let segments = PathResolver::parse(path)?;
        for segment in &segments {
            if let Segment::Call { name, args } = segment {
                if self.registry.knows_name(name) {
                    continue;
                }
                let function =
                    FunctionName::from_str(name).map_err(|_| RuleError::UnresolvedSegment {
                        path: path.to_string(),
                        segment: name.clone(),
                    })?;
                function.check_args(args)?;
            }
        }
        Ok(segments)
    }

    /// Size the right literal to the operator: set operators require an
    /// array (a JSON-encoded array string is accepted), the rest take the
    /// literal as given.
    fn parse_literal(&self, leaf: &LeafCondition) -> Result<Value> {
        if !leaf.operator.wants_array_literal() {
            return Ok(leaf.right.clone());
        }
        match &leaf.right {
            Value::Array(_) => Ok(leaf.right.clone()),
            Value::String(raw) => {
                let parsed: Value = serde_json::from_str(raw).map_err(|_| {
                    RuleError::Format(format!(
                        "operator '{}' requires an array literal, got '{raw}'",
                        leaf.operator
                    ))
                })?;
                if parsed.is_array() {
                    Ok(parsed)
                } else {
                    Err(RuleError::Format(format!(
                        "operator '{}' requires an array literal",
                        leaf.operator
                    )))
                }
            }
            other => Err(RuleError::Format(format!(
                "operator '{}' requires an array literal, got {other}",
                leaf.operator
            ))),
        }
    }
}
