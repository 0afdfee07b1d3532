//! Evidence values captured for failed rule leaves.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A captured operand value, normalized to a small closed set of shapes so
/// evidence serializes uniformly regardless of the payload's own types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum EvidenceValue {
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<EvidenceValue>),
    /// The operand could not be resolved on this payload.
    Missing,
}

impl EvidenceValue {
    /// Convert a JSON value into evidence form.
    ///
    /// Objects have no scalar rendering; they collapse to their compact
    /// JSON text so diagnostics never lose the raw shape.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => EvidenceValue::Missing,
            Value::Bool(b) => EvidenceValue::Bool(*b),
            Value::Number(n) => n
                .as_f64()
                .map(EvidenceValue::Num)
                .unwrap_or(EvidenceValue::Missing),
            Value::String(s) => EvidenceValue::Str(s.clone()),
            Value::Array(items) => {
                EvidenceValue::List(items.iter().map(EvidenceValue::from_json).collect())
            }
            Value::Object(_) => EvidenceValue::Str(value.to_string()),
        }
    }

    /// Render the value as a display string for logs and reports.
    pub fn render(&self) -> String {
        match self {
            EvidenceValue::Str(s) => s.clone(),
            EvidenceValue::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            EvidenceValue::Bool(b) => b.to_string(),
            EvidenceValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.render()).collect();
                format!("[{}]", parts.join(", "))
            }
            EvidenceValue::Missing => "<missing>".to_string(),
        }
    }
}

/// Diagnostic record for one leaf condition of a failed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// The left-hand property path of the leaf.
    pub property_path: String,
    /// Expected operand value (right side, post-coercion).
    pub expected: EvidenceValue,
    /// Actual operand value (left side, post-coercion).
    pub actual: EvidenceValue,
    /// Partial-credit score for this leaf, in `[0, 1]`.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(
            EvidenceValue::from_json(&json!("ok")),
            EvidenceValue::Str("ok".to_string())
        );
        assert_eq!(EvidenceValue::from_json(&json!(4.5)), EvidenceValue::Num(4.5));
        assert_eq!(EvidenceValue::from_json(&json!(true)), EvidenceValue::Bool(true));
        assert_eq!(EvidenceValue::from_json(&json!(null)), EvidenceValue::Missing);
    }

    #[test]
    fn test_from_json_array() {
        let v = EvidenceValue::from_json(&json!([1, "a"]));
        assert_eq!(
            v,
            EvidenceValue::List(vec![
                EvidenceValue::Num(1.0),
                EvidenceValue::Str("a".to_string())
            ])
        );
    }

    #[test]
    fn test_render() {
        assert_eq!(EvidenceValue::Num(3.0).render(), "3");
        assert_eq!(EvidenceValue::Num(3.25).render(), "3.25");
        assert_eq!(
            EvidenceValue::List(vec![EvidenceValue::Str("a".into())]).render(),
            "[a]"
        );
        assert_eq!(EvidenceValue::Missing.render(), "<missing>");
    }
}
