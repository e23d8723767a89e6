//! Action dispatch.
//!
//! Actions never touch engine state directly. The dispatcher resolves
//! an action to property writes and events on an [`EffectSink`], which
//! the engine implements over its own store. Host-registered handlers
//! are consulted before built-ins, so a handler registered under a
//! built-in type name overrides it; a custom type with no handler is an
//! error at dispatch time.

use std::collections::BTreeMap;

use formwork_core::{Action, RuleError, Value};

use crate::interp::{EvalContext, EvalEnv, Interpreter};

/// Where action effects land: property writes and outward events. The
/// sink is also the re-entry point for handlers that need another
/// field's state mid-dispatch -- the engine's sink runs a full nested
/// evaluation, memoized and guarded against same-field recursion.
pub trait EffectSink {
    fn set_property(&mut self, target: &str, value: Value) -> Result<(), RuleError>;
    fn fire_event(&mut self, event: &str, params: &Value) -> Result<(), RuleError>;
    fn evaluate_field(&mut self, field: &str) -> Result<BTreeMap<String, Value>, RuleError>;
}

/// Everything a handler may read while executing: the interpreter, the
/// assembled context, the evaluation environment, the owning field, and
/// whether that field has already been initialized.
pub struct ActionScope<'a> {
    pub interpreter: &'a Interpreter,
    pub ctx: &'a EvalContext,
    pub env: EvalEnv<'a>,
    pub field: &'a str,
    pub initialized: bool,
}

/// A registered action handler, keyed by action type. Receives the
/// payload in value form.
pub type ActionHandler =
    Box<dyn Fn(&ActionScope<'_>, &Value, &mut dyn EffectSink) -> Result<(), RuleError>>;

/// Declares which target paths a custom action type writes, for
/// dependency extraction and priority validation.
pub type TargetExtractorFn = Box<dyn Fn(&Value) -> Vec<String>>;

#[derive(Default)]
pub struct ActionDispatcher {
    handlers: BTreeMap<String, ActionHandler>,
    extractors: BTreeMap<String, TargetExtractorFn>,
}

impl ActionDispatcher {
    pub fn new() -> Self {
        ActionDispatcher::default()
    }

    /// Register (or replace) a handler. Built-in type names may be
    /// overridden.
    pub fn register_handler(&mut self, action_type: impl Into<String>, handler: ActionHandler) {
        self.handlers.insert(action_type.into(), handler);
    }

    /// Register the target extractor for a custom action type. Without
    /// one the type contributes no writes.
    pub fn register_target_extractor(
        &mut self,
        action_type: impl Into<String>,
        extractor: TargetExtractorFn,
    ) {
        self.extractors.insert(action_type.into(), extractor);
    }

    pub fn has_handler(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Execute one action against the sink. The handler registry is
    /// consulted first; built-in semantics apply otherwise.
    pub fn dispatch(
        &self,
        action: &Action,
        scope: &ActionScope<'_>,
        sink: &mut dyn EffectSink,
    ) -> Result<(), RuleError> {
        if let Some(handler) = self.handlers.get(action.type_name()) {
            return handler(scope, &action.payload(), sink);
        }

        match action {
            Action::Set { target, value } => sink.set_property(target, value.clone()),
            Action::Copy { source, target } => {
                sink.set_property(target, scope.ctx.lookup(source))
            }
            Action::Calculate { target, formula } => {
                // Shared rules are expanded before evaluation, same as
                // conditions.
                let resolved = scope.env.shared.resolve(formula)?;
                let value = scope.interpreter.eval(&resolved, scope.ctx, scope.env)?;
                sink.set_property(target, value)
            }
            Action::Trigger { event, params } => sink.fire_event(event, params),
            Action::Batch(actions) => {
                for sub in actions {
                    self.dispatch(sub, scope, sink)?;
                }
                Ok(())
            }
            Action::Init {
                field_state,
                field_value,
            } => {
                // One-shot: a no-op once the field has been initialized.
                if scope.initialized {
                    return Ok(());
                }
                if let Some(state) = field_state {
                    for (prop, value) in state {
                        sink.set_property(&format!("{}.{}", scope.field, prop), value.clone())?;
                    }
                }
                if let Some(value) = field_value {
                    // A bare field target writes the field's input value.
                    sink.set_property(scope.field, value.clone())?;
                }
                Ok(())
            }
            Action::Custom { action_type, .. } => Err(RuleError::UnknownActionType {
                action_type: action_type.clone(),
            }),
        }
    }

    /// Target paths a custom action writes, per its extractor.
    pub fn custom_targets(&self, action: &Action) -> Vec<String> {
        match action {
            Action::Custom {
                action_type,
                payload,
            } => self
                .extractors
                .get(action_type)
                .map(|extract| extract(payload))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// All target paths an action writes, for conflict validation.
    /// `field` stands in for targets implied by the owning field (init).
    pub fn targets(&self, field: &str, action: &Action) -> Vec<String> {
        match action {
            Action::Set { target, .. }
            | Action::Copy { target, .. }
            | Action::Calculate { target, .. } => vec![target.clone()],
            Action::Trigger { .. } => Vec::new(),
            Action::Batch(actions) => actions
                .iter()
                .flat_map(|sub| self.targets(field, sub))
                .collect(),
            Action::Init { .. } => vec![field.to_string()],
            Action::Custom { .. } => self.custom_targets(action),
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
