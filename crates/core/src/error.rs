//! Error taxonomy for rule loading and evaluation.
//!
//! Every failure is raised synchronously at its call site (`load_rule_set`,
//! `evaluate_field`, `update_field`, or a JSON parse boundary) and is never
//! retried or downgraded internally. Recovery -- typically reloading a
//! corrected rule set -- is the host's responsibility.

use thiserror::Error;

/// Errors that can occur while parsing, loading, or evaluating rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// An expression object node did not carry exactly one operator key,
    /// or an operand had the wrong shape for its operator.
    #[error("malformed expression: {message}")]
    MalformedExpression { message: String },

    /// An operator name matched neither the custom registry nor a built-in.
    #[error("unknown operator: {op}")]
    UnknownOperator { op: String },

    /// An attempt to register a custom operator under a name the
    /// evaluator cannot hand over (the lazy iteration operators).
    #[error("operator '{op}' cannot be replaced")]
    ReservedOperator { op: String },

    /// An action type with no registered handler was dispatched.
    #[error("unknown action type: {action_type}")]
    UnknownActionType { action_type: String },

    /// A field dependency cycle, or a shared rule that references itself
    /// (directly or transitively) during `$ref` expansion.
    #[error("circular dependency involving '{field}'")]
    CircularDependency { field: String },

    /// Two rules on the same field claim the same target at the same
    /// priority.
    #[error("priority conflict on field '{field}': target '{target}' at priority {priority}")]
    PriorityConflict {
        field: String,
        target: String,
        priority: i64,
    },

    /// A `$ref` named a shared rule that is not registered.
    #[error("unknown shared rule: {name}")]
    UnknownSharedRule { name: String },

    /// A `lookup` named a table that is not registered.
    #[error("unknown lookup table: {table}")]
    UnknownLookupTable { table: String },

    /// A rule was missing its condition or action, or carried a
    /// non-integer priority.
    #[error("invalid rule structure for field '{field}': {message}")]
    InvalidRuleStructure { field: String, message: String },

    /// An empty target path, or a dotted write that traverses through an
    /// existing non-map property.
    #[error("invalid target path: {path}")]
    InvalidTargetPath { path: String },

    /// Strict arithmetic/comparison operand error. `+` never falls back
    /// to string concatenation.
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    /// Checked arithmetic failure, including division by zero.
    #[error("arithmetic overflow: {message}")]
    Overflow { message: String },
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
