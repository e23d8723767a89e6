//! formwork-eval: the reactive rule evaluation engine.
//!
//! Computes per-field output state (visibility, required-ness,
//! calculated values, arbitrary custom properties) from a shared input
//! context, re-evaluating only what changed. The pieces, leaves first:
//!
//! - [`interp`] -- the logic-tree expression interpreter
//! - [`deps`] -- read/write extraction and the dependency graph
//! - [`store`] -- per-field state and the validity cache
//! - [`actions`] -- tagged-action dispatch over an effect sink
//! - [`validate`] -- priority ordering and conflict detection
//! - [`context`] -- pluggable context providers
//! - [`engine`] -- the orchestrator tying it all together
//!
//! Everything is single-threaded and synchronous; evaluation either
//! runs to completion or raises a [`formwork_core::RuleError`].
//!
//! ```
//! use formwork_core::{RuleSet, Value};
//! use formwork_eval::Engine;
//!
//! let mut engine = Engine::new();
//! let rules = RuleSet::from_json(&serde_json::json!({
//!     "a": [{
//!         "condition": {"==": [{"var": ["b"]}, "x"]},
//!         "action": {"set": {"target": "a.isVisible", "value": true}},
//!         "priority": 1
//!     }]
//! }))?;
//! engine.load_rule_set(rules)?;
//! engine.update_field("b", Value::Text("x".into()));
//! let snapshot = engine.evaluate_field("a")?;
//! assert_eq!(snapshot.get("isVisible"), Some(&Value::Bool(true)));
//! # Ok::<(), formwork_core::RuleError>(())
//! ```

pub mod actions;
pub mod context;
pub mod deps;
pub mod engine;
pub mod interp;
pub mod numeric;
pub mod store;
pub mod validate;

pub use actions::{ActionDispatcher, ActionHandler, ActionScope, EffectSink, TargetExtractorFn};
pub use context::{ContextAggregator, ContextProvider, StaticContextProvider};
pub use deps::{AccessSet, DependencyGraph, DependencyTracker, ExprVisitorFn, WalkState};
pub use engine::{Engine, EventCallback, PropertyCallback};
pub use interp::{EvalContext, EvalEnv, EvalTrace, Interpreter, OperatorFn};
pub use store::{DefaultStateFn, FieldStateStore};
