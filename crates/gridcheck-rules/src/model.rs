//! Condition DSL model.
//!
//! Rules arrive as JSON condition trees:
//!
//! ```json
//! {
//!   "allOf": [
//!     { "left": "Status", "operator": "equals", "right": "online" },
//!     { "anyOf": [
//!       { "left": "Load.Average()", "operator": "lessThan", "right": 80 },
//!       { "left": "Redundancy", "operator": "equals", "right": "2N" }
//!     ]}
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operators::Operator;

/// One node of a condition tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpression {
    /// Logical AND over one or more children.
    AllOf {
        #[serde(rename = "allOf")]
        all_of: Vec<ConditionExpression>,
    },
    /// Logical OR over one or more children.
    AnyOf {
        #[serde(rename = "anyOf")]
        any_of: Vec<ConditionExpression>,
    },
    /// Logical negation.
    Not { not: Box<ConditionExpression> },
    /// Atomic comparison.
    Leaf(LeafCondition),
}

/// Atomic comparison: `left operator right`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafCondition {
    /// Property path on the payload.
    pub left: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Literal value, or a property path when `right_side_is_expression`.
    #[serde(default)]
    pub right: Value,
    /// Interpret `right` as a second property path instead of a literal.
    #[serde(rename = "rightSideIsExpression", default)]
    pub right_side_is_expression: bool,
    /// Extra operator arguments (channel names, tolerances, durations).
    #[serde(rename = "operatorArgs", default)]
    pub operator_args: Vec<String>,
}

impl ConditionExpression {
    /// Collect every leaf in document order.
    pub fn leaves(&self) -> Vec<&LeafCondition> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a LeafCondition>) {
        match self {
            ConditionExpression::Leaf(leaf) => out.push(leaf),
            ConditionExpression::Not { not } => not.collect_leaves(out),
            ConditionExpression::AllOf { all_of } => {
                for child in all_of {
                    child.collect_leaves(out);
                }
            }
            ConditionExpression::AnyOf { any_of } => {
                for child in any_of {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

/// A named validation rule: `when` scopes applicability, `if` asserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Rule set this rule belongs to.
    #[serde(rename = "ruleSet", default)]
    pub rule_set: String,
    /// Applicability filter; a rule with no filter applies to every payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<ConditionExpression>,
    /// The assertion evaluated for applicable payloads.
    #[serde(rename = "if")]
    pub assert: ConditionExpression,
}

/// Named grouping of rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    pub rules: Vec<Rule>,
}
