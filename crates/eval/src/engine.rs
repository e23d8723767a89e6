//! The engine: dependency-first, memoized field evaluation.
//!
//! Owns the rule set, the dependency graph, the field-state store, and
//! every extension registry. `load_rule_set` validates before any state
//! changes and drops every validity flag on success; `evaluate_field`
//! serves cached snapshots when valid and otherwise recurses into
//! rule-owning dependencies before running the field's own rules;
//! `update_fields` merges new input values and flips validity flags
//! over the invalidation closure without running anything.
//!
//! Mutation flows through one owned state bundle ([`EngineState`])
//! separate from the registries, so a custom action handler can legally
//! re-enter evaluation mid-dispatch through its sink: the nested call
//! borrows the same bundle the dispatch already holds, stays memoized,
//! and the evaluation stack turns same-field recursion into an
//! in-progress snapshot instead of a loop.
//!
//! There is no transactional rollback: if an action raises partway
//! through a pass, earlier writes from the same pass persist and the
//! field's cache entry stays invalid, forcing a fresh pass on next
//! access.

use std::collections::{BTreeMap, BTreeSet};

use formwork_core::{Action, FieldRule, LookupTable, RuleError, RuleSet, SharedRuleTable, Value};

use crate::actions::{ActionDispatcher, ActionHandler, ActionScope, EffectSink, TargetExtractorFn};
use crate::context::{ContextAggregator, ContextProvider};
use crate::deps::{DependencyGraph, DependencyTracker, ExprVisitorFn};
use crate::interp::{EvalContext, EvalEnv, Interpreter, OperatorFn};
use crate::store::{DefaultStateFn, FieldStateStore};
use crate::validate;

/// Host callback observing rule property writes.
pub type PropertyCallback = Box<dyn FnMut(&str, &Value)>;
/// Host callback observing fired events.
pub type EventCallback = Box<dyn FnMut(&str, &Value)>;

/// Everything evaluation mutates, bundled so nested and re-entrant
/// passes borrow one place.
#[derive(Default)]
struct EngineState {
    store: FieldStateStore,
    inputs: BTreeMap<String, Value>,
    initialized: BTreeSet<String>,
    evaluating: Vec<String>,
    aggregator: ContextAggregator,
    property_callbacks: Vec<PropertyCallback>,
    event_callbacks: Vec<EventCallback>,
}

/// The read-only side of an evaluation pass: rules, registries, and the
/// graph. Copyable borrows so nested passes carry them freely.
#[derive(Clone, Copy)]
struct EngineParts<'a> {
    rule_set: &'a RuleSet,
    shared: &'a SharedRuleTable,
    lookups: &'a BTreeMap<String, LookupTable>,
    interpreter: &'a Interpreter,
    dispatcher: &'a ActionDispatcher,
    graph: &'a DependencyGraph,
}

#[derive(Default)]
pub struct Engine {
    rule_set: RuleSet,
    shared: SharedRuleTable,
    lookups: BTreeMap<String, LookupTable>,
    interpreter: Interpreter,
    dispatcher: ActionDispatcher,
    tracker: DependencyTracker,
    graph: DependencyGraph,
    state: EngineState,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    // ──────────────────────────────────────────────
    // Registration
    // ──────────────────────────────────────────────

    /// Merge shared rules additively; incoming names win.
    pub fn register_shared_rules(&mut self, table: SharedRuleTable) {
        self.shared.merge(table);
    }

    pub fn register_lookup_table(&mut self, name: impl Into<String>, table: LookupTable) {
        self.lookups.insert(name.into(), table);
    }

    /// Register a custom expression operator.
    pub fn register_operator(
        &mut self,
        name: impl Into<String>,
        f: OperatorFn,
    ) -> Result<(), RuleError> {
        self.interpreter.register_operator(name, f)
    }

    /// Register a custom action handler, optionally with a target
    /// extractor so its writes stay visible to dependency tracking and
    /// conflict validation.
    pub fn register_action(
        &mut self,
        action_type: impl Into<String>,
        handler: ActionHandler,
        target_extractor: Option<TargetExtractorFn>,
    ) {
        let action_type = action_type.into();
        if let Some(extractor) = target_extractor {
            self.dispatcher
                .register_target_extractor(action_type.clone(), extractor);
        }
        self.dispatcher.register_handler(action_type, handler);
    }

    /// Register a dependency visitor for a custom operator.
    pub fn register_expr_visitor(&mut self, op: impl Into<String>, f: ExprVisitorFn) {
        self.tracker.register_expr_visitor(op, f);
    }

    pub fn register_context_provider(&mut self, provider: Box<dyn ContextProvider>) {
        self.state.aggregator.register(provider);
    }

    pub fn on_property_set(&mut self, callback: PropertyCallback) {
        self.state.property_callbacks.push(callback);
    }

    pub fn on_event(&mut self, callback: EventCallback) {
        self.state.event_callbacks.push(callback);
    }

    /// Override the defaults new field states start from.
    pub fn set_default_state_factory(&mut self, factory: DefaultStateFn) {
        self.state.store.set_default_factory(factory);
    }

    // ──────────────────────────────────────────────
    // Loading and inspection
    // ──────────────────────────────────────────────

    /// Validate and install a rule set. Priority conflicts, unknown
    /// shared rules, and dependency cycles all fail here, before any
    /// engine state changes. On success every cached snapshot is
    /// invalidated (state and inputs retained), since it was computed
    /// under rules that no longer apply.
    pub fn load_rule_set(&mut self, rule_set: RuleSet) -> Result<(), RuleError> {
        validate::validate_rule_set(&rule_set, &self.dispatcher)?;
        let graph = self
            .tracker
            .build_graph(&rule_set, &self.shared, &self.dispatcher)?;
        graph.validate_no_cycles(|field| rule_set.owns_rules(field))?;
        self.rule_set = rule_set;
        self.graph = graph;
        for field in self.state.store.invalidate_all() {
            self.state.aggregator.notify_field_invalidated(&field);
        }
        Ok(())
    }

    pub fn get_dependencies_of(&self, field: &str) -> BTreeSet<String> {
        self.graph.dependencies_of(field)
    }

    pub fn get_dependents_of(&self, field: &str) -> BTreeSet<String> {
        self.graph.dependents_of(field)
    }

    pub fn input(&self, field: &str) -> Option<&Value> {
        self.state.inputs.get(field)
    }

    /// Drop all field state, inputs, validity, and init markers.
    pub fn reset(&mut self) {
        self.state.store.clear_all();
        self.state.inputs.clear();
        self.state.initialized.clear();
        self.state.aggregator.notify_cache_cleared();
    }

    // ──────────────────────────────────────────────
    // Updates
    // ──────────────────────────────────────────────

    /// Merge new input values without evaluating anything, flip the
    /// validity flag on every transitive dependent, and return those
    /// fields.
    pub fn update_fields(&mut self, values: BTreeMap<String, Value>) -> Vec<String> {
        let changed: Vec<String> = values.keys().cloned().collect();
        self.state.inputs.extend(values);
        let invalidated = self.graph.invalidated_fields(&changed);
        for field in &invalidated {
            self.state.store.invalidate(field);
            self.state.aggregator.notify_field_invalidated(field);
        }
        invalidated.into_iter().collect()
    }

    pub fn update_field(&mut self, field: impl Into<String>, value: Value) -> Vec<String> {
        self.update_fields(BTreeMap::from([(field.into(), value)]))
    }

    // ──────────────────────────────────────────────
    // Evaluation
    // ──────────────────────────────────────────────

    /// The field's state snapshot, re-evaluating only if its cache
    /// entry is invalid.
    pub fn evaluate_field(&mut self, field: &str) -> Result<BTreeMap<String, Value>, RuleError> {
        let parts = EngineParts {
            rule_set: &self.rule_set,
            shared: &self.shared,
            lookups: &self.lookups,
            interpreter: &self.interpreter,
            dispatcher: &self.dispatcher,
            graph: &self.graph,
        };
        evaluate(parts, &mut self.state, field)
    }
}

/// One memoized evaluation, re-entrancy-guarded: a field already on the
/// evaluation stack yields its in-progress snapshot.
fn evaluate(
    parts: EngineParts<'_>,
    state: &mut EngineState,
    field: &str,
) -> Result<BTreeMap<String, Value>, RuleError> {
    if state.store.is_valid(field) {
        return Ok(state.store.snapshot(field));
    }
    if state.evaluating.iter().any(|f| f == field) {
        return Ok(state.store.snapshot(field));
    }
    state.evaluating.push(field.to_string());
    let result = run_field_pass(parts, state, field);
    state.evaluating.pop();
    result
}

fn run_field_pass(
    parts: EngineParts<'_>,
    state: &mut EngineState,
    field: &str,
) -> Result<BTreeMap<String, Value>, RuleError> {
    // Dependencies first, so their computed values are fresh in the
    // context this field's rules see. Dependency-only inputs are not
    // recursed into.
    for dep in parts.graph.dependencies_of(field) {
        if parts.rule_set.owns_rules(&dep) && !state.evaluating.iter().any(|f| f == &dep) {
            evaluate(parts, state, &dep)?;
        }
    }

    let rules = parts.rule_set.get(field).to_vec();
    // Rule sets may be swapped between passes, so the conflict check
    // runs on every pass, not only at load.
    validate::validate_no_priority_conflicts(field, &rules, parts.dispatcher)?;

    state.store.reset(field);

    let mut init_rules: Vec<&FieldRule> = rules.iter().filter(|r| r.action.is_init()).collect();
    let mut regular: Vec<&FieldRule> = rules.iter().filter(|r| !r.action.is_init()).collect();
    validate::sort_by_priority(&mut init_rules);
    validate::sort_by_priority(&mut regular);

    // Init: only the first rule whose condition holds, and only if the
    // field has never been initialized.
    if !state.initialized.contains(field) {
        for rule in &init_rules {
            if condition_holds(parts, state, rule)? {
                dispatch_action(parts, state, field, &rule.action)?;
                state.initialized.insert(field.to_string());
                break;
            }
        }
    }

    for rule in &regular {
        if condition_holds(parts, state, rule)? {
            dispatch_action(parts, state, field, &rule.action)?;
        }
    }

    state.store.mark_valid(field);
    Ok(state.store.snapshot(field))
}

fn condition_holds(
    parts: EngineParts<'_>,
    state: &EngineState,
    rule: &FieldRule,
) -> Result<bool, RuleError> {
    let condition = parts.shared.resolve(&rule.condition)?;
    let ctx = assemble_context(state);
    let env = EvalEnv {
        shared: parts.shared,
        lookups: parts.lookups,
    };
    Ok(parts.interpreter.eval(&condition, &ctx, env)?.truthy())
}

fn dispatch_action(
    parts: EngineParts<'_>,
    state: &mut EngineState,
    field: &str,
    action: &Action,
) -> Result<(), RuleError> {
    let ctx = assemble_context(state);
    let scope = ActionScope {
        interpreter: parts.interpreter,
        ctx: &ctx,
        env: EvalEnv {
            shared: parts.shared,
            lookups: parts.lookups,
        },
        field,
        initialized: state.initialized.contains(field),
    };
    let mut sink = EngineSink { parts, state };
    parts.dispatcher.dispatch(action, &scope, &mut sink)
}

/// Fresh evaluation context: base inputs, overlaid with every field's
/// non-null calculated value, then the provider fold.
fn assemble_context(state: &EngineState) -> EvalContext {
    let mut base = state.inputs.clone();
    for (field, field_state) in state.store.iter_states() {
        if let Some(calculated) = field_state.get("calculatedValue") {
            if !calculated.is_null() {
                base.insert(field.to_string(), calculated.clone());
            }
        }
    }
    EvalContext::from_values(state.aggregator.assemble(base))
}

/// Routes action effects into the engine's state bundle. Bare targets
/// (no dot) write the field's input value; dotted targets write field
/// state. Carries the read-only parts so handlers can re-enter
/// evaluation.
struct EngineSink<'a> {
    parts: EngineParts<'a>,
    state: &'a mut EngineState,
}

impl EffectSink for EngineSink<'_> {
    fn set_property(&mut self, target: &str, value: Value) -> Result<(), RuleError> {
        match target.split_once('.') {
            None => {
                if target.is_empty() {
                    return Err(RuleError::InvalidTargetPath {
                        path: target.to_string(),
                    });
                }
                self.state.inputs.insert(target.to_string(), value.clone());
            }
            Some((field, property)) => {
                self.state.store.set(field, property, value.clone())?;
            }
        }
        self.state.aggregator.notify_property_set(target, &value);
        for callback in self.state.property_callbacks.iter_mut() {
            callback(target, &value);
        }
        Ok(())
    }

    fn fire_event(&mut self, event: &str, params: &Value) -> Result<(), RuleError> {
        for callback in self.state.event_callbacks.iter_mut() {
            callback(event, params);
        }
        Ok(())
    }

    fn evaluate_field(&mut self, field: &str) -> Result<BTreeMap<String, Value>, RuleError> {
        evaluate(self.parts, self.state, field)
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
