//! formwork-core: data model for the formwork rule engine.
//!
//! Provides the typed forms of everything that crosses the wire
//! boundary: runtime values, the logic-tree expression language, tagged
//! actions, field rules, shared-rule tables, and lookup tables. All
//! structural invariants the JSON format cannot express (exactly one
//! operator key per node, exactly one type key per action, integer
//! priorities) are enforced during parsing here.
//!
//! # Public API
//!
//! Key types are re-exported at the crate root:
//!
//! - [`Value`] -- runtime values (no `f64` anywhere)
//! - [`Expr`] -- parsed logic expressions
//! - [`Action`], [`FieldRule`], [`RuleSet`] -- the rule model
//! - [`SharedRuleTable`] -- `$ref` fragments with cycle-guarded expansion
//! - [`LookupTable`] -- keyed flat datasets
//! - [`RuleError`] -- the single error taxonomy

pub mod error;
pub mod expr;
pub mod rule;
pub mod value;

pub use error::RuleError;
pub use expr::{ArithOp, CompareOp, Expr, IterOp};
pub use rule::{Action, FieldRule, LookupTable, RuleSet, SharedRuleTable};
pub use value::Value;
