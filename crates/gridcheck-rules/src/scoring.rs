//! Partial-credit scoring and diagnostic extractors.
//!
//! Failed assertions are ranked by how close they came instead of a flat
//! fail: numeric comparisons score as a distance ratio, set operators as
//! the overlap fraction, equality-like operators as 0/1. A payload that
//! satisfies the leaf always scores exactly `1.0`.

use std::sync::Arc;

use serde_json::Value;

use gridcheck_core::{DevicePayload, EvidenceValue};

use crate::compiler::{CompiledLeaf, Extractor, ScoreFn};
use crate::error::{Result, RuleError};
use crate::operators::{as_f64, channel_value, values_equal, Operator};

/// Cap for unsatisfied leaves. A strict comparison sitting exactly on the
/// threshold must still rank strictly below a pass.
const UNSATISFIED_CAP: f64 = 1.0 - 1e-9;

/// Build the partial-credit score function for a compiled leaf.
///
/// Negated set operators have no meaningful overlap direction and report
/// [`RuleError::UnsupportedScoring`]; the caller downgrades those leaves
/// to a constant zero score.
pub(crate) fn score_fn(leaf: CompiledLeaf) -> Result<ScoreFn> {
    match leaf.operator {
        Operator::NotAllIn | Operator::NotAnyIn | Operator::NotContainsAll => {
            Err(RuleError::UnsupportedScoring {
                operator: leaf.operator.to_string(),
                operand_type: "set".to_string(),
            })
        }
        _ => Ok(Arc::new(move |payload: &DevicePayload| {
            let (left, right) = match (leaf.left_value(payload), leaf.right_value(payload)) {
                (Ok(l), Ok(r)) => (l, r),
                _ => return 0.0,
            };
            match leaf.operator.apply(&left, &right, &leaf.args) {
                Ok(true) => 1.0,
                Ok(false) => partial(leaf.operator, &left, &right, &leaf.args)
                    .clamp(0.0, UNSATISFIED_CAP),
                Err(_) => 0.0,
            }
        })),
    }
}

/// Distance-based credit for an unsatisfied leaf.
fn partial(operator: Operator, left: &Value, right: &Value, args: &[String]) -> f64 {
    match operator {
        Operator::GreaterThan | Operator::GreaterThanOrEqual => {
            ratio(as_f64(left), as_f64(right))
        }
        // Symmetric direction: credit grows as the actual shrinks back
        // toward the bound.
        Operator::LessThan | Operator::LessThanOrEqual => ratio(as_f64(right), as_f64(left)),
        Operator::ContainsAll => overlap_fraction(left, right, Direction::OfExpected),
        Operator::AllIn | Operator::AnyIn => overlap_fraction(left, right, Direction::OfActual),
        Operator::DiffWithinPct => {
            let (Some(actual), Some(expected)) = (as_f64(left), as_f64(right)) else {
                return 0.0;
            };
            let Some(tolerance) = args.first().and_then(|raw| raw.trim().parse::<f64>().ok())
            else {
                return 0.0;
            };
            if expected == 0.0 {
                return 0.0;
            }
            let diff_pct = ((actual - expected) / expected).abs() * 100.0;
            if diff_pct == 0.0 { 1.0 } else { tolerance / diff_pct }
        }
        Operator::AllInRangePct => in_range_fraction(left, right, args),
        // Equality-like and absence operators are all-or-nothing.
        _ => 0.0,
    }
}

fn ratio(numerator: Option<f64>, denominator: Option<f64>) -> f64 {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d > 0.0 && n > 0.0 => n / d,
        _ => 0.0,
    }
}

enum Direction {
    /// Fraction of the expected set that was found.
    OfExpected,
    /// Fraction of the actual set that was allowed.
    OfActual,
}

fn overlap_fraction(left: &Value, right: &Value, direction: Direction) -> f64 {
    let (Some(actual), Some(expected)) = (left.as_array(), right.as_array()) else {
        return 0.0;
    };
    let denominator = match direction {
        Direction::OfExpected => expected.len(),
        Direction::OfActual => actual.len(),
    };
    if denominator == 0 {
        return 0.0;
    }
    let hits = match direction {
        Direction::OfExpected => expected
            .iter()
            .filter(|e| actual.iter().any(|a| values_equal(a, e)))
            .count(),
        Direction::OfActual => actual
            .iter()
            .filter(|a| expected.iter().any(|e| values_equal(e, a)))
            .count(),
    };
    hits as f64 / denominator as f64
}

fn in_range_fraction(left: &Value, right: &Value, args: &[String]) -> f64 {
    let (Some(items), Some(expected)) = (left.as_array(), as_f64(right)) else {
        return 0.0;
    };
    let Some(tolerance) = args.first().and_then(|raw| raw.trim().parse::<f64>().ok()) else {
        return 0.0;
    };
    if items.is_empty() || expected == 0.0 {
        return 0.0;
    }
    let hits = items
        .iter()
        .filter_map(as_f64)
        .filter(|x| ((x - expected) / expected).abs() * 100.0 <= tolerance)
        .count();
    hits as f64 / items.len() as f64
}

/// Extractor for the actual (left) operand, post-coercion.
pub(crate) fn evidence_fn(leaf: CompiledLeaf) -> Extractor {
    Arc::new(move |payload: &DevicePayload| {
        let Ok(left) = leaf.left_value(payload) else {
            return EvidenceValue::Missing;
        };
        // Domain operators compare a projection of the operand; capture
        // what was actually compared.
        match leaf.operator {
            Operator::ChannelEquals => {
                let Some(channel) = leaf.args.first() else {
                    return EvidenceValue::Missing;
                };
                match channel_value(&left, channel) {
                    Ok(Some(value)) => EvidenceValue::from_json(value),
                    _ => EvidenceValue::Missing,
                }
            }
            Operator::QualityIs => match left.get("quality") {
                Some(quality) => EvidenceValue::from_json(quality),
                None => EvidenceValue::from_json(&left),
            },
            _ => EvidenceValue::from_json(&left),
        }
    })
}

/// Extractor for the expected (right) operand.
pub(crate) fn expectation_fn(leaf: CompiledLeaf) -> Extractor {
    Arc::new(move |payload: &DevicePayload| match leaf.right_value(payload) {
        Ok(right) => EvidenceValue::from_json(&right),
        Err(_) => EvidenceValue::Missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ConditionCompiler;
    use crate::functions::MacroRegistry;
    use crate::model::ConditionExpression;
    use serde_json::json;

    fn scorer(left: &str, operator: &str, right: Value) -> ScoreFn {
        let expr: ConditionExpression = serde_json::from_value(json!({
            "left": left, "operator": operator, "right": right
        }))
        .unwrap();
        let ConditionExpression::Leaf(leaf) = expr else { unreachable!() };
        let compiler = ConditionCompiler::new(Arc::new(MacroRegistry::new()));
        score_fn(compiler.compile_leaf(&leaf).unwrap()).unwrap()
    }

    fn payload(data: Value) -> DevicePayload {
        DevicePayload::new("dev-1", "ups", data)
    }

    #[test]
    fn test_greater_than_satisfied_scores_exactly_one() {
        let score = scorer("Load", "greaterThan", json!(100));
        assert_eq!(score(&payload(json!({ "Load": 101 }))), 1.0);
    }

    #[test]
    fn test_greater_than_boundary_scores_strictly_below_one() {
        let score = scorer("Load", "greaterThan", json!(100));
        let boundary = score(&payload(json!({ "Load": 100 })));
        assert!(boundary < 1.0);
        assert!(boundary > 0.9);
    }

    #[test]
    fn test_numeric_score_is_monotonic() {
        let score = scorer("Load", "greaterThan", json!(100));
        let s25 = score(&payload(json!({ "Load": 25 })));
        let s50 = score(&payload(json!({ "Load": 50 })));
        let s75 = score(&payload(json!({ "Load": 75 })));
        assert!(s25 < s50 && s50 < s75);
        assert!((0.0..=1.0).contains(&s25));
    }

    #[test]
    fn test_less_than_symmetric_ratio() {
        let score = scorer("Load", "lessThan", json!(80));
        assert_eq!(score(&payload(json!({ "Load": 79 }))), 1.0);
        let over = score(&payload(json!({ "Load": 160 })));
        assert!((over - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_equality_is_binary() {
        let score = scorer("Status", "equals", json!("online"));
        assert_eq!(score(&payload(json!({ "Status": "online" }))), 1.0);
        assert_eq!(score(&payload(json!({ "Status": "onlin" }))), 0.0);
    }

    #[test]
    fn test_contains_all_overlap_fraction() {
        let score = scorer("Alarms", "containsAll", json!(["a", "b", "c", "d"]));
        let half = score(&payload(json!({ "Alarms": ["a", "b", "x"] })));
        assert!((half - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_all_in_overlap_of_actual() {
        let score = scorer("Feeds", "allIn", json!(["a", "b"]));
        let partial = score(&payload(json!({ "Feeds": ["a", "z", "q", "b"] })));
        assert!((partial - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_diff_within_pct_partial() {
        let expr: ConditionExpression = serde_json::from_value(json!({
            "left": "Reading", "operator": "diffWithinPct", "right": 100,
            "operatorArgs": ["5"]
        }))
        .unwrap();
        let ConditionExpression::Leaf(leaf) = expr else { unreachable!() };
        let compiler = ConditionCompiler::new(Arc::new(MacroRegistry::new()));
        let score = score_fn(compiler.compile_leaf(&leaf).unwrap()).unwrap();
        assert_eq!(score(&payload(json!({ "Reading": 103 }))), 1.0);
        let off = score(&payload(json!({ "Reading": 110 })));
        assert!((off - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_operand_scores_zero() {
        let score = scorer("Load", "greaterThan", json!(100));
        assert_eq!(score(&payload(json!({}))), 0.0);
    }

    #[test]
    fn test_negated_set_operator_is_unsupported() {
        let expr: ConditionExpression = serde_json::from_value(json!({
            "left": "Feeds", "operator": "notAllIn", "right": ["a"]
        }))
        .unwrap();
        let ConditionExpression::Leaf(leaf) = expr else { unreachable!() };
        let compiler = ConditionCompiler::new(Arc::new(MacroRegistry::new()));
        assert!(matches!(
            score_fn(compiler.compile_leaf(&leaf).unwrap()),
            Err(RuleError::UnsupportedScoring { .. })
        ));
    }

    #[test]
    fn test_evidence_and_expectation() {
        let expr: ConditionExpression = serde_json::from_value(json!({
            "left": "Load", "operator": "lessThan", "right": 80
        }))
        .unwrap();
        let ConditionExpression::Leaf(leaf) = expr else { unreachable!() };
        let compiler = ConditionCompiler::new(Arc::new(MacroRegistry::new()));
        let compiled = compiler.compile_leaf(&leaf).unwrap();
        let actual = evidence_fn(compiled.clone())(&payload(json!({ "Load": 92 })));
        assert_eq!(actual, EvidenceValue::Num(92.0));
        let expected = expectation_fn(compiled)(&payload(json!({ "Load": 92 })));
        assert_eq!(expected, EvidenceValue::Num(80.0));
    }

    #[test]
    fn test_channel_evidence_captures_channel_value() {
        let expr: ConditionExpression = serde_json::from_value(json!({
            "left": "Points", "operator": "channelEquals", "right": 42,
            "operatorArgs": ["kW Input"]
        }))
        .unwrap();
        let ConditionExpression::Leaf(leaf) = expr else { unreachable!() };
        let compiler = ConditionCompiler::new(Arc::new(MacroRegistry::new()));
        let extract = evidence_fn(compiler.compile_leaf(&leaf).unwrap());
        let value = extract(&payload(json!({
            "Points": [{ "channel": "kW Input", "value": 41.5 }]
        })));
        assert_eq!(value, EvidenceValue::Num(41.5));
    }
}
