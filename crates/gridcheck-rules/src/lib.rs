//! Rule expression engine for GridCheck.
//!
//! Compiles the JSON condition DSL into reusable predicates, partial-credit
//! score functions, and evidence extractors over device object graphs.
//!
//! The engine is layered bottom-up:
//! - [`path`] splits and classifies property paths;
//! - [`functions`] interprets path-segment functions (aggregates,
//!   navigation, parent-chain traversal) and hosts the macro registry;
//! - [`operators`] defines the closed comparison operator table;
//! - [`compiler`] turns a condition tree into an executable predicate;
//! - [`scoring`] derives per-leaf score functions and diagnostics.

pub mod compiler;
pub mod error;
pub mod functions;
pub mod model;
pub mod operators;
pub mod path;
pub mod scoring;

pub use compiler::{CompiledRule, ConditionCompiler, Predicate};
pub use error::{Result, RuleError};
pub use functions::{FunctionName, MacroRegistry};
pub use model::{ConditionExpression, LeafCondition, Rule, RuleSet};
pub use operators::Operator;
pub use path::{PathResolver, Segment};
