//! Error types for the rule engine.

use thiserror::Error;

// Re-export the core error type
pub use gridcheck_core::Error as CoreError;

/// Result type for rule engine operations.
pub type Result<T> = std::result::Result<T, RuleError>;

#[derive(Debug, Error)]
pub enum RuleError {
    /// Unbalanced parentheses or a group with no owning function name.
    #[error("Malformed path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    /// A segment matched no macro, function, indexer, or property.
    #[error("Unresolved path segment '{segment}' in '{path}'")]
    UnresolvedSegment { path: String, segment: String },

    /// Operator name not in the closed operator table.
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),

    /// Structural DSL violation (empty allOf/anyOf, bad literal shape).
    #[error("Format error: {0}")]
    Format(String),

    /// Compile failure scoped to one rule.
    #[error("Rule '{rule_id}' failed to compile: {reason}")]
    Compile { rule_id: String, reason: String },

    /// No partial-credit function exists for this operand type/operator.
    #[error("Scoring unsupported for operator '{operator}' on {operand_type} operands")]
    UnsupportedScoring {
        operator: String,
        operand_type: String,
    },

    /// Runtime failure while evaluating a compiled expression.
    #[error("Evaluation error: {0}")]
    Eval(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RuleError> for CoreError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::Serialization(e) => CoreError::Serialization(e.to_string()),
            other => CoreError::Rule(other.to_string()),
        }
    }
}
