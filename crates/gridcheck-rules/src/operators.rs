//! Closed comparison operator table.
//!
//! Operators compare two resolved operand values. A missing (null) left
//! operand makes every comparison evaluate to `false` rather than error;
//! only the null/empty checks look at absence itself.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RuleError};
use crate::functions::parse_duration_token;

/// Comparison operators recognized in leaf conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    NotContains,
    ContainsAll,
    NotContainsAll,
    StartsWith,
    NotStartsWith,
    In,
    NotIn,
    AllIn,
    NotAllIn,
    AnyIn,
    NotAnyIn,
    IsNull,
    NotIsNull,
    IsEmpty,
    NotIsEmpty,
    DiffWithinPct,
    AllInRangePct,
    /// Compare the value of a named telemetry channel in a point list.
    /// `operatorArgs[0]` selects the channel.
    ChannelEquals,
    /// Compare a telemetry point's quality flag (case-insensitive).
    QualityIs,
    /// Point timestamp is no older than the duration token in `right`
    /// (`<int><m|h|d>`, same grammar as the `Ago` function).
    FresherThan,
}

impl Operator {
    /// Operators whose semantics are about absence; they receive the raw
    /// (possibly null) operand instead of failing the null guard.
    pub fn is_null_tolerant(self) -> bool {
        matches!(
            self,
            Operator::IsNull | Operator::NotIsNull | Operator::IsEmpty | Operator::NotIsEmpty
        )
    }

    /// Operators whose right-hand literal must parse as an array.
    pub fn wants_array_literal(self) -> bool {
        matches!(
            self,
            Operator::In
                | Operator::NotIn
                | Operator::AllIn
                | Operator::NotAllIn
                | Operator::AnyIn
                | Operator::NotAnyIn
                | Operator::ContainsAll
                | Operator::NotContainsAll
        )
    }

    /// The non-negated operator this one inverts, if any.
    pub fn negation_of(self) -> Option<Operator> {
        match self {
            Operator::NotEquals => Some(Operator::Equals),
            Operator::NotContains => Some(Operator::Contains),
            Operator::NotContainsAll => Some(Operator::ContainsAll),
            Operator::NotStartsWith => Some(Operator::StartsWith),
            Operator::NotIn => Some(Operator::In),
            Operator::NotAllIn => Some(Operator::AllIn),
            Operator::NotAnyIn => Some(Operator::AnyIn),
            Operator::NotIsNull => Some(Operator::IsNull),
            Operator::NotIsEmpty => Some(Operator::IsEmpty),
            _ => None,
        }
    }

    /// The restricted subset allowed inside `Where(...)` filters.
    pub fn allowed_in_where(self) -> bool {
        matches!(
            self,
            Operator::Equals
                | Operator::NotEquals
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::Contains
        )
    }

    /// Evaluate this operator over two resolved operands.
    pub fn apply(self, left: &Value, right: &Value, args: &[String]) -> Result<bool> {
        // Absence checks see the raw operand.
        match self {
            Operator::IsNull => return Ok(left.is_null()),
            Operator::NotIsNull => return Ok(!left.is_null()),
            Operator::IsEmpty => return Ok(is_empty(left)),
            Operator::NotIsEmpty => return Ok(!is_empty(left)),
            _ => {}
        }

        // Implicit null guard: a missing left operand never satisfies a
        // comparison, negated forms included.
        if left.is_null() {
            return Ok(false);
        }

        if let Some(base) = self.negation_of() {
            return base.apply(left, right, args).map(|r| !r);
        }

        match self {
            Operator::Equals => Ok(values_equal(left, right)),
            Operator::GreaterThan => ordered_compare(left, right, Ordering::is_gt),
            Operator::GreaterThanOrEqual => ordered_compare(left, right, Ordering::is_ge),
            Operator::LessThan => ordered_compare(left, right, Ordering::is_lt),
            Operator::LessThanOrEqual => ordered_compare(left, right, Ordering::is_le),
            Operator::Contains => contains(left, right),
            Operator::ContainsAll => contains_all(left, right),
            Operator::StartsWith => starts_with(left, right),
            Operator::In => in_list(left, right),
            Operator::AllIn => all_in(left, right),
            Operator::AnyIn => any_in(left, right),
            Operator::DiffWithinPct => diff_within_pct(left, right, args),
            Operator::AllInRangePct => all_in_range_pct(left, right, args),
            Operator::ChannelEquals => channel_equals(left, right, args),
            Operator::QualityIs => quality_is(left, right),
            Operator::FresherThan => fresher_than(left, right),
            // Handled above.
            Operator::IsNull
            | Operator::NotIsNull
            | Operator::IsEmpty
            | Operator::NotIsEmpty
            | Operator::NotEquals
            | Operator::NotContains
            | Operator::NotContainsAll
            | Operator::NotStartsWith
            | Operator::NotIn
            | Operator::NotAllIn
            | Operator::NotAnyIn => unreachable!(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{name}")
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        serde_json::from_value::<Operator>(Value::String(s.to_string()))
            .or_else(|_| {
                // Accept PascalCase spellings by lowering the first letter.
                let mut chars = s.chars();
                let camel = match chars.next() {
                    Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
                    None => String::new(),
                };
                serde_json::from_value::<Operator>(Value::String(camel))
            })
            .map_err(|_| RuleError::UnknownOperator(lowered))
    }
}

/// Numeric-aware value equality: numbers compare as f64 so `100 == 100.0`,
/// strings compare case-sensitively, everything else structurally.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return (a - b).abs() < f64::EPSILON;
    }
    left == right
}

/// Coerce a value to f64: numbers directly, numeric strings by parsing.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(obj) => obj.is_empty(),
        _ => false,
    }
}

fn require_f64(value: &Value) -> Result<f64> {
    as_f64(value).ok_or_else(|| {
        RuleError::Eval(format!("expected number, found {}", type_name(value)))
    })
}

fn require_array(value: &Value) -> Result<&Vec<Value>> {
    value.as_array().ok_or_else(|| {
        RuleError::Eval(format!("expected array, found {}", type_name(value)))
    })
}

fn require_str(value: &Value) -> Result<&str> {
    value.as_str().ok_or_else(|| {
        RuleError::Eval(format!("expected string, found {}", type_name(value)))
    })
}

/// Order two operands: numerically when both coerce to f64, lexically when
/// both are strings (RFC 3339 timestamps order correctly this way).
fn ordered_compare<F>(left: &Value, right: &Value, accept: F) -> Result<bool>
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
        return Ok(a
            .partial_cmp(&b)
            .map(accept)
            .unwrap_or(false));
    }
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(accept(a.as_str().cmp(b.as_str())));
    }
    Err(RuleError::Eval(format!(
        "cannot order {} against {}",
        type_name(left),
        type_name(right)
    )))
}

fn contains(left: &Value, right: &Value) -> Result<bool> {
    match left {
        Value::String(s) => Ok(s.contains(require_str(right)?)),
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, right))),
        _ => Err(RuleError::Eval(format!(
            "contains expects string or array, found {}",
            type_name(left)
        ))),
    }
}

fn contains_all(left: &Value, right: &Value) -> Result<bool> {
    let haystack = require_array(left)?;
    let needles = require_array(right)?;
    Ok(needles
        .iter()
        .all(|needle| haystack.iter().any(|item| values_equal(item, needle))))
}

fn starts_with(left: &Value, right: &Value) -> Result<bool> {
    Ok(require_str(left)?.starts_with(require_str(right)?))
}

fn in_list(left: &Value, right: &Value) -> Result<bool> {
    Ok(require_array(right)?
        .iter()
        .any(|item| values_equal(item, left)))
}

fn all_in(left: &Value, right: &Value) -> Result<bool> {
    let items = require_array(left)?;
    let allowed = require_array(right)?;
    Ok(items
        .iter()
        .all(|item| allowed.iter().any(|a| values_equal(a, item))))
}

fn any_in(left: &Value, right: &Value) -> Result<bool> {
    let items = require_array(left)?;
    let allowed = require_array(right)?;
    Ok(items
        .iter()
        .any(|item| allowed.iter().any(|a| values_equal(a, item))))
}

fn tolerance_pct(args: &[String]) -> Result<f64> {
    let raw = args
        .first()
        .ok_or_else(|| RuleError::Eval("missing tolerance operatorArgs[0]".to_string()))?;
    raw.trim()
        .parse()
        .map_err(|_| RuleError::Eval(format!("invalid tolerance '{raw}'")))
}

/// Percentage distance of `actual` from `expected`; infinite when the
/// reference is zero and the values differ.
fn pct_diff(actual: f64, expected: f64) -> f64 {
    if expected == 0.0 {
        if actual == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        ((actual - expected) / expected).abs() * 100.0
    }
}

fn diff_within_pct(left: &Value, right: &Value, args: &[String]) -> Result<bool> {
    let tolerance = tolerance_pct(args)?;
    Ok(pct_diff(require_f64(left)?, require_f64(right)?) <= tolerance)
}

fn all_in_range_pct(left: &Value, right: &Value, args: &[String]) -> Result<bool> {
    let tolerance = tolerance_pct(args)?;
    let expected = require_f64(right)?;
    for item in require_array(left)? {
        if pct_diff(require_f64(item)?, expected) > tolerance {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Look up the named channel in a telemetry point list and return its value.
pub fn channel_value<'a>(points: &'a Value, channel: &str) -> Result<Option<&'a Value>> {
    let points = require_array(points)?;
    for point in points {
        if let Some(name) = point.get("channel").and_then(Value::as_str) {
            if name.eq_ignore_ascii_case(channel) {
                return Ok(point.get("value"));
            }
        }
    }
    Ok(None)
}

fn channel_equals(left: &Value, right: &Value, args: &[String]) -> Result<bool> {
    let channel = args
        .first()
        .ok_or_else(|| RuleError::Eval("missing channel name operatorArgs[0]".to_string()))?;
    match channel_value(left, channel)? {
        Some(value) => Ok(values_equal(value, right)),
        None => Ok(false),
    }
}

fn quality_is(left: &Value, right: &Value) -> Result<bool> {
    let quality = match left {
        Value::String(s) => s.as_str(),
        Value::Object(_) => match left.get("quality").and_then(Value::as_str) {
            Some(q) => q,
            None => return Ok(false),
        },
        _ => {
            return Err(RuleError::Eval(format!(
                "qualityIs expects point or string, found {}",
                type_name(left)
            )))
        }
    };
    Ok(quality.eq_ignore_ascii_case(require_str(right)?))
}

fn fresher_than(left: &Value, right: &Value) -> Result<bool> {
    let raw = match left {
        Value::String(s) => s.as_str(),
        Value::Object(_) => match left.get("timestamp").and_then(Value::as_str) {
            Some(ts) => ts,
            None => return Ok(false),
        },
        _ => {
            return Err(RuleError::Eval(format!(
                "fresherThan expects timestamp or point, found {}",
                type_name(left)
            )))
        }
    };
    let timestamp = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| RuleError::Eval(format!("invalid timestamp '{raw}': {e}")))?
        .with_timezone(&Utc);
    let max_age = parse_duration_token(require_str(right)?)?;
    Ok(Utc::now() - timestamp <= max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equals_numeric_widening() {
        assert!(Operator::Equals.apply(&json!(100), &json!(100.0), &[]).unwrap());
        assert!(!Operator::Equals.apply(&json!("100"), &json!("101"), &[]).unwrap());
    }

    #[test]
    fn test_equals_strings_case_sensitive() {
        assert!(Operator::Equals.apply(&json!("Online"), &json!("Online"), &[]).unwrap());
        assert!(!Operator::Equals.apply(&json!("Online"), &json!("online"), &[]).unwrap());
    }

    #[test]
    fn test_comparisons() {
        assert!(Operator::GreaterThan.apply(&json!(10), &json!(5), &[]).unwrap());
        assert!(!Operator::GreaterThan.apply(&json!(5), &json!(5), &[]).unwrap());
        assert!(Operator::GreaterThanOrEqual.apply(&json!(5), &json!(5), &[]).unwrap());
        assert!(Operator::LessThanOrEqual.apply(&json!(5), &json!(5), &[]).unwrap());
    }

    #[test]
    fn test_string_comparisons_order_lexically() {
        // RFC 3339 timestamps in the same offset compare correctly as text.
        assert!(Operator::GreaterThan
            .apply(&json!("2026-08-28T10:00:00+00:00"), &json!("2026-08-28T09:00:00+00:00"), &[])
            .unwrap());
        assert!(!Operator::GreaterThan
            .apply(&json!("b"), &json!("c"), &[])
            .unwrap());
        assert!(Operator::GreaterThan.apply(&json!("x"), &json!(1), &[]).is_err());
    }

    #[test]
    fn test_null_left_is_false_not_error() {
        assert!(!Operator::Contains.apply(&json!(null), &json!("x"), &[]).unwrap());
        assert!(!Operator::Equals.apply(&json!(null), &json!(null), &[]).unwrap());
        assert!(!Operator::NotEquals.apply(&json!(null), &json!("x"), &[]).unwrap());
    }

    #[test]
    fn test_null_checks_see_absence() {
        assert!(Operator::IsNull.apply(&json!(null), &json!(null), &[]).unwrap());
        assert!(!Operator::NotIsNull.apply(&json!(null), &json!(null), &[]).unwrap());
        assert!(Operator::IsEmpty.apply(&json!([]), &json!(null), &[]).unwrap());
        assert!(Operator::NotIsEmpty.apply(&json!("x"), &json!(null), &[]).unwrap());
    }

    #[test]
    fn test_contains_string_and_array() {
        assert!(Operator::Contains.apply(&json!("breaker-12"), &json!("breaker"), &[]).unwrap());
        assert!(Operator::Contains.apply(&json!(["a", "b"]), &json!("b"), &[]).unwrap());
        assert!(Operator::NotContains.apply(&json!(["a"]), &json!("b"), &[]).unwrap());
    }

    #[test]
    fn test_set_operators() {
        assert!(Operator::ContainsAll
            .apply(&json!(["a", "b", "c"]), &json!(["a", "c"]), &[])
            .unwrap());
        assert!(Operator::In.apply(&json!("a"), &json!(["a", "b"]), &[]).unwrap());
        assert!(Operator::AllIn.apply(&json!(["a"]), &json!(["a", "b"]), &[]).unwrap());
        assert!(!Operator::AllIn.apply(&json!(["a", "z"]), &json!(["a", "b"]), &[]).unwrap());
        assert!(Operator::AnyIn.apply(&json!(["z", "b"]), &json!(["a", "b"]), &[]).unwrap());
        assert!(Operator::NotAnyIn.apply(&json!(["z"]), &json!(["a", "b"]), &[]).unwrap());
    }

    #[test]
    fn test_diff_within_pct() {
        let args = vec!["5".to_string()];
        assert!(Operator::DiffWithinPct.apply(&json!(104), &json!(100), &args).unwrap());
        assert!(!Operator::DiffWithinPct.apply(&json!(110), &json!(100), &args).unwrap());
    }

    #[test]
    fn test_all_in_range_pct() {
        let args = vec!["10".to_string()];
        assert!(Operator::AllInRangePct
            .apply(&json!([95, 102, 108]), &json!(100), &args)
            .unwrap());
        assert!(!Operator::AllInRangePct
            .apply(&json!([95, 120]), &json!(100), &args)
            .unwrap());
    }

    #[test]
    fn test_channel_equals() {
        let points = json!([
            { "channel": "kW Input", "value": 42.0 },
            { "channel": "kW Output", "value": 40.0 }
        ]);
        let args = vec!["kw input".to_string()];
        assert!(Operator::ChannelEquals.apply(&points, &json!(42), &args).unwrap());
        let missing = vec!["kVar".to_string()];
        assert!(!Operator::ChannelEquals.apply(&points, &json!(42), &missing).unwrap());
    }

    #[test]
    fn test_quality_is() {
        let point = json!({ "value": 1.0, "quality": "Good" });
        assert!(Operator::QualityIs.apply(&point, &json!("good"), &[]).unwrap());
        assert!(!Operator::QualityIs.apply(&point, &json!("stale"), &[]).unwrap());
    }

    #[test]
    fn test_fresher_than() {
        let recent = json!((Utc::now() - chrono::Duration::minutes(2)).to_rfc3339());
        assert!(Operator::FresherThan.apply(&recent, &json!("15m"), &[]).unwrap());
        let old = json!((Utc::now() - chrono::Duration::hours(3)).to_rfc3339());
        assert!(!Operator::FresherThan.apply(&old, &json!("1h"), &[]).unwrap());
    }

    #[test]
    fn test_from_str_accepts_both_casings() {
        assert_eq!("equals".parse::<Operator>().unwrap(), Operator::Equals);
        assert_eq!("GreaterThanOrEqual".parse::<Operator>().unwrap(), Operator::GreaterThanOrEqual);
        assert!("frobnicate".parse::<Operator>().is_err());
    }
}
