//! Dependency extraction and the field dependency graph.
//!
//! A walker derives, for any expression or action, the pair of field
//! sets it reads (`dependencies`) and writes (`dependents`). Built-in
//! operators have exact handling: `var` paths contribute their leading
//! segment (the iteration-local `$` contributes nothing), `$ref`
//! expands the shared rule under a cycle guard, and `lookup` recurses
//! only into its key expression. Everything unknown falls through to a
//! total default that recurses into the whole operand structure, so an
//! unregistered custom operator can never silently lose a dependency.
//!
//! The graph is rebuilt once per rule-set load; invalidation closures
//! are a BFS over the reverse edges.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use formwork_core::{Action, Expr, RuleError, RuleSet, SharedRuleTable};

use crate::actions::ActionDispatcher;

/// Fields read and written by an expression or action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessSet {
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

/// Mutable state threaded through an expression walk: accumulated reads
/// plus the in-progress `$ref` expansion stack.
#[derive(Debug, Default)]
pub struct WalkState {
    reads: BTreeSet<String>,
    expanding: Vec<String>,
}

impl WalkState {
    pub fn new() -> Self {
        WalkState::default()
    }

    /// Record a field read. Custom visitors call this for paths they
    /// understand.
    pub fn add_read(&mut self, field: impl Into<String>) {
        self.reads.insert(field.into());
    }

    fn into_reads(self) -> BTreeSet<String> {
        self.reads
    }
}

/// A per-operator dependency visitor for custom operators. Receives the
/// operand expressions and may recurse through the tracker.
pub type ExprVisitorFn =
    Box<dyn Fn(&DependencyTracker, &[Expr], &SharedRuleTable, &mut WalkState) -> Result<(), RuleError>>;

/// Walks expressions and actions to extract field access sets.
#[derive(Default)]
pub struct DependencyTracker {
    expr_visitors: BTreeMap<String, ExprVisitorFn>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker::default()
    }

    /// Register a dependency visitor for a custom operator. Without one,
    /// the operator's operands are walked with the total default.
    pub fn register_expr_visitor(&mut self, op: impl Into<String>, f: ExprVisitorFn) {
        self.expr_visitors.insert(op.into(), f);
    }

    /// Fields read by an expression.
    pub fn expr_access(
        &self,
        expr: &Expr,
        shared: &SharedRuleTable,
    ) -> Result<AccessSet, RuleError> {
        let mut state = WalkState::new();
        self.walk_expr(expr, shared, &mut state)?;
        Ok(AccessSet {
            reads: state.into_reads(),
            writes: BTreeSet::new(),
        })
    }

    /// Fields read and written by an action. Custom actions contribute
    /// writes through their registered target extractor and reads
    /// through the total-default payload walk.
    pub fn action_access(
        &self,
        action: &Action,
        shared: &SharedRuleTable,
        dispatcher: &ActionDispatcher,
    ) -> Result<AccessSet, RuleError> {
        let mut access = AccessSet::default();
        self.collect_action(action, shared, dispatcher, &mut access)?;
        Ok(access)
    }

    pub fn walk_expr(
        &self,
        expr: &Expr,
        shared: &SharedRuleTable,
        state: &mut WalkState,
    ) -> Result<(), RuleError> {
        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Var { path } => {
                if let Some(field) = leading_field(path) {
                    state.add_read(field);
                }
                Ok(())
            }
            Expr::Ref { name } => {
                if state.expanding.iter().any(|n| n == name) {
                    return Err(RuleError::CircularDependency {
                        field: name.clone(),
                    });
                }
                let inner = shared
                    .get(name)
                    .ok_or_else(|| RuleError::UnknownSharedRule { name: name.clone() })?;
                state.expanding.push(name.clone());
                self.walk_expr(inner, shared, state)?;
                state.expanding.pop();
                Ok(())
            }
            // Only the key is an expression; table and property names
            // are opaque literals.
            Expr::Lookup { key, .. } => self.walk_expr(key, shared, state),
            Expr::Seq(args)
            | Expr::Arith { args, .. }
            | Expr::Compare { args, .. }
            | Expr::And(args)
            | Expr::Or(args)
            | Expr::If(args) => {
                for arg in args {
                    self.walk_expr(arg, shared, state)?;
                }
                Ok(())
            }
            Expr::Not(arg) => self.walk_expr(arg, shared, state),
            Expr::Iter { source, body, .. } => {
                self.walk_expr(source, shared, state)?;
                self.walk_expr(body, shared, state)
            }
            Expr::Custom { name, args } => match self.expr_visitors.get(name) {
                Some(visitor) => visitor(self, args, shared, state),
                None => {
                    for arg in args {
                        self.walk_expr(arg, shared, state)?;
                    }
                    Ok(())
                }
            },
        }
    }

    fn collect_action(
        &self,
        action: &Action,
        shared: &SharedRuleTable,
        dispatcher: &ActionDispatcher,
        access: &mut AccessSet,
    ) -> Result<(), RuleError> {
        match action {
            Action::Set { target, .. } => {
                access.writes.insert(target_field(target)?);
                Ok(())
            }
            Action::Copy { source, target } => {
                if let Some(field) = leading_field(source) {
                    access.reads.insert(field);
                }
                access.writes.insert(target_field(target)?);
                Ok(())
            }
            Action::Calculate { target, formula } => {
                access.writes.insert(target_field(target)?);
                let mut state = WalkState::new();
                self.walk_expr(formula, shared, &mut state)?;
                access.reads.extend(state.into_reads());
                Ok(())
            }
            // Init governs its own field; trigger only fires outward.
            Action::Trigger { .. } | Action::Init { .. } => Ok(()),
            Action::Batch(actions) => {
                for sub in actions {
                    self.collect_action(sub, shared, dispatcher, access)?;
                }
                Ok(())
            }
            Action::Custom { payload, .. } => {
                for target in dispatcher.custom_targets(action) {
                    access.writes.insert(target_field(&target)?);
                }
                let mut state = WalkState::new();
                self.walk_payload(&payload.to_json(), shared, &mut state)?;
                access.reads.extend(state.into_reads());
                Ok(())
            }
        }
    }

    /// Total default for custom action payloads: any object node that
    /// parses as an expression is walked as one; everything else is
    /// recursed into structurally.
    fn walk_payload(
        &self,
        payload: &serde_json::Value,
        shared: &SharedRuleTable,
        state: &mut WalkState,
    ) -> Result<(), RuleError> {
        match payload {
            serde_json::Value::Object(obj) => {
                if let Ok(expr) = Expr::from_json(payload) {
                    return self.walk_expr(&expr, shared, state);
                }
                for value in obj.values() {
                    self.walk_payload(value, shared, state)?;
                }
                Ok(())
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    self.walk_payload(item, shared, state)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Build the forward and reverse graphs for a rule set: each field's
    /// dependencies are the union of everything its rules' conditions
    /// and actions read.
    pub fn build_graph(
        &self,
        rule_set: &RuleSet,
        shared: &SharedRuleTable,
        dispatcher: &ActionDispatcher,
    ) -> Result<DependencyGraph, RuleError> {
        let mut graph = DependencyGraph::default();
        for (field, rules) in rule_set.iter() {
            let mut reads = BTreeSet::new();
            for rule in rules {
                let mut state = WalkState::new();
                self.walk_expr(&rule.condition, shared, &mut state)?;
                reads.extend(state.into_reads());
                let access = self.action_access(&rule.action, shared, dispatcher)?;
                reads.extend(access.reads);
            }
            graph.dependencies.insert(field.clone(), reads);
        }
        for (field, reads) in &graph.dependencies {
            for read in reads {
                graph
                    .dependents
                    .entry(read.clone())
                    .or_default()
                    .insert(field.clone());
            }
        }
        Ok(graph)
    }
}

/// Leading path segment as a field name; `$`-rooted paths are
/// iteration-local and contribute nothing.
fn leading_field(path: &str) -> Option<String> {
    if path == "$" || path.starts_with("$.") {
        return None;
    }
    let head = path.split('.').next().unwrap_or(path);
    if head.is_empty() {
        None
    } else {
        Some(head.to_string())
    }
}

/// Field a target path writes to: its leading segment.
pub fn target_field(path: &str) -> Result<String, RuleError> {
    let head = path.split('.').next().unwrap_or("");
    if head.is_empty() {
        return Err(RuleError::InvalidTargetPath {
            path: path.to_string(),
        });
    }
    Ok(head.to_string())
}

/// Forward and reverse field dependency edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// field -> fields it reads.
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    /// field -> fields that read it.
    pub dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn dependencies_of(&self, field: &str) -> BTreeSet<String> {
        self.dependencies.get(field).cloned().unwrap_or_default()
    }

    pub fn dependents_of(&self, field: &str) -> BTreeSet<String> {
        self.dependents.get(field).cloned().unwrap_or_default()
    }

    /// Depth-first cycle check over fields that carry rules, with an
    /// explicit stack so arbitrarily deep chains cannot exhaust the
    /// native call stack. Fails naming a field on the cycle.
    pub fn validate_no_cycles(
        &self,
        owns_rules: impl Fn(&str) -> bool,
    ) -> Result<(), RuleError> {
        let mut done: BTreeSet<String> = BTreeSet::new();
        let mut on_stack: BTreeSet<String> = BTreeSet::new();

        let neighbors = |field: &str| -> Vec<String> {
            self.dependencies
                .get(field)
                .map(|deps| {
                    deps.iter()
                        .filter(|d| owns_rules(d))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        for start in self.dependencies.keys() {
            if done.contains(start) || !owns_rules(start) {
                continue;
            }
            let mut stack: Vec<(String, Vec<String>)> = vec![(start.clone(), neighbors(start))];
            on_stack.insert(start.clone());

            while !stack.is_empty() {
                let next = stack
                    .last_mut()
                    .and_then(|(_, pending)| pending.pop());
                match next {
                    Some(candidate) => {
                        if on_stack.contains(&candidate) {
                            return Err(RuleError::CircularDependency { field: candidate });
                        }
                        if !done.contains(&candidate) {
                            let n = neighbors(&candidate);
                            on_stack.insert(candidate.clone());
                            stack.push((candidate, n));
                        }
                    }
                    None => {
                        if let Some((finished, _)) = stack.pop() {
                            on_stack.remove(&finished);
                            done.insert(finished);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Every field transitively reachable from `changed` over the
    /// reverse edges. The seeds themselves are not included.
    pub fn invalidated_fields(&self, changed: &[String]) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<&str> = changed.iter().map(String::as_str).collect();
        while let Some(field) = queue.pop_front() {
            if let Some(dependents) = self.dependents.get(field) {
                for dependent in dependents {
                    if out.insert(dependent.clone()) {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        out
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use formwork_core::FieldRule;

    fn parse(v: serde_json::Value) -> Expr {
        Expr::from_json(&v).unwrap()
    }

    fn rule(condition: serde_json::Value, action: serde_json::Value) -> FieldRule {
        FieldRule {
            condition: parse(condition),
            action: Action::from_json("test", &action).unwrap(),
            priority: 1,
            description: None,
        }
    }

    fn reads_of(expr: serde_json::Value) -> BTreeSet<String> {
        let tracker = DependencyTracker::new();
        let shared = SharedRuleTable::new();
        tracker
            .expr_access(&parse(expr), &shared)
            .unwrap()
            .reads
    }

    #[test]
    fn var_contributes_leading_segment_only() {
        let reads = reads_of(serde_json::json!({"==": [{"var": "order.total.amount"}, 5]}));
        assert_eq!(reads, BTreeSet::from(["order".to_string()]));
    }

    #[test]
    fn iteration_binding_contributes_nothing() {
        let reads = reads_of(serde_json::json!(
            {"some": [{"var": "items"}, {">": [{"var": "$.qty"}, 3]}]}
        ));
        assert_eq!(reads, BTreeSet::from(["items".to_string()]));
    }

    #[test]
    fn lookup_recurses_into_key_only() {
        let reads = reads_of(serde_json::json!({"lookup": ["products", {"var": "sel"}, "price"]}));
        assert_eq!(reads, BTreeSet::from(["sel".to_string()]));
    }

    #[test]
    fn refs_expand_under_cycle_guard() {
        let tracker = DependencyTracker::new();
        let mut shared = SharedRuleTable::new();
        shared.register(
            "isAdmin",
            parse(serde_json::json!({"==": [{"var": "role"}, "admin"]})),
        );
        let access = tracker
            .expr_access(&parse(serde_json::json!({"$ref": "isAdmin"})), &shared)
            .unwrap();
        assert_eq!(access.reads, BTreeSet::from(["role".to_string()]));

        shared.register("a", parse(serde_json::json!({"$ref": "b"})));
        shared.register("b", parse(serde_json::json!({"$ref": "a"})));
        let err = tracker
            .expr_access(&parse(serde_json::json!({"$ref": "a"})), &shared)
            .unwrap_err();
        assert!(matches!(err, RuleError::CircularDependency { .. }));
    }

    #[test]
    fn unregistered_custom_operator_walks_all_operands() {
        let reads = reads_of(serde_json::json!({"concat": [{"var": "first"}, {"var": "last"}]}));
        assert_eq!(
            reads,
            BTreeSet::from(["first".to_string(), "last".to_string()])
        );
    }

    #[test]
    fn registered_visitor_overrides_default_walk() {
        let mut tracker = DependencyTracker::new();
        tracker.register_expr_visitor(
            "tagOf",
            Box::new(|_, _, _, state| {
                state.add_read("tags");
                Ok(())
            }),
        );
        let shared = SharedRuleTable::new();
        let access = tracker
            .expr_access(
                &parse(serde_json::json!({"tagOf": [{"var": "ignored"}]})),
                &shared,
            )
            .unwrap();
        assert_eq!(access.reads, BTreeSet::from(["tags".to_string()]));
    }

    #[test]
    fn action_reads_and_writes() {
        let tracker = DependencyTracker::new();
        let shared = SharedRuleTable::new();
        let dispatcher = ActionDispatcher::new();

        let copy = Action::from_json(
            "a",
            &serde_json::json!({"copy": {"source": "b.value", "target": "a.calculatedValue"}}),
        )
        .unwrap();
        let access = tracker.action_access(&copy, &shared, &dispatcher).unwrap();
        assert_eq!(access.reads, BTreeSet::from(["b".to_string()]));
        assert_eq!(access.writes, BTreeSet::from(["a".to_string()]));

        let calc = Action::from_json(
            "a",
            &serde_json::json!({"calculate": {
                "target": "a.calculatedValue",
                "formula": {"*": [{"var": "qty"}, {"var": "price"}]}
            }}),
        )
        .unwrap();
        let access = tracker.action_access(&calc, &shared, &dispatcher).unwrap();
        assert_eq!(
            access.reads,
            BTreeSet::from(["qty".to_string(), "price".to_string()])
        );

        let batch = Action::from_json(
            "a",
            &serde_json::json!({"batch": [
                {"set": {"target": "a.isVisible", "value": true}},
                {"trigger": {"event": "shown"}}
            ]}),
        )
        .unwrap();
        let access = tracker.action_access(&batch, &shared, &dispatcher).unwrap();
        assert_eq!(access.writes, BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn custom_action_payload_walk_is_total() {
        let tracker = DependencyTracker::new();
        let shared = SharedRuleTable::new();
        let dispatcher = ActionDispatcher::new();
        let action = Action::from_json(
            "a",
            &serde_json::json!({"notify": {"when": {"var": "status"}, "channel": "ops"}}),
        )
        .unwrap();
        let access = tracker
            .action_access(&action, &shared, &dispatcher)
            .unwrap();
        assert_eq!(access.reads, BTreeSet::from(["status".to_string()]));
    }

    fn graph_for(rule_set: &RuleSet) -> DependencyGraph {
        let tracker = DependencyTracker::new();
        let shared = SharedRuleTable::new();
        let dispatcher = ActionDispatcher::new();
        tracker.build_graph(rule_set, &shared, &dispatcher).unwrap()
    }

    #[test]
    fn graph_is_the_exact_inverse() {
        let mut rs = RuleSet::new();
        rs.insert(
            "a",
            vec![rule(
                serde_json::json!({"==": [{"var": "b"}, 1]}),
                serde_json::json!({"set": {"target": "a.isVisible", "value": true}}),
            )],
        );
        let graph = graph_for(&rs);
        assert_eq!(graph.dependencies_of("a"), BTreeSet::from(["b".to_string()]));
        assert_eq!(graph.dependents_of("b"), BTreeSet::from(["a".to_string()]));
    }

    #[test]
    fn cycle_detection_names_a_field_on_the_cycle() {
        let mut rs = RuleSet::new();
        rs.insert(
            "a",
            vec![rule(
                serde_json::json!({"==": [{"var": "b"}, 1]}),
                serde_json::json!({"set": {"target": "a.isVisible", "value": true}}),
            )],
        );
        rs.insert(
            "b",
            vec![rule(
                serde_json::json!({"==": [{"var": "a"}, 1]}),
                serde_json::json!({"set": {"target": "b.isVisible", "value": true}}),
            )],
        );
        let graph = graph_for(&rs);
        let err = graph
            .validate_no_cycles(|f| rs.owns_rules(f))
            .unwrap_err();
        match err {
            RuleError::CircularDependency { field } => {
                assert!(field == "a" || field == "b");
            }
            other => panic!("expected CircularDependency, got {:?}", other),
        }
    }

    #[test]
    fn dependency_only_inputs_do_not_form_cycles() {
        // a reads x, b reads x and a; x owns no rules.
        let mut rs = RuleSet::new();
        rs.insert(
            "a",
            vec![rule(
                serde_json::json!({"var": "x"}),
                serde_json::json!({"set": {"target": "a.isVisible", "value": true}}),
            )],
        );
        rs.insert(
            "b",
            vec![rule(
                serde_json::json!({"and": [{"var": "x"}, {"var": "a"}]}),
                serde_json::json!({"set": {"target": "b.isVisible", "value": true}}),
            )],
        );
        let graph = graph_for(&rs);
        assert!(graph.validate_no_cycles(|f| rs.owns_rules(f)).is_ok());
    }

    #[test]
    fn invalidation_closure_is_transitive_and_excludes_seeds() {
        // c reads b, b reads a.
        let mut rs = RuleSet::new();
        rs.insert(
            "b",
            vec![rule(
                serde_json::json!({"var": "a"}),
                serde_json::json!({"set": {"target": "b.isVisible", "value": true}}),
            )],
        );
        rs.insert(
            "c",
            vec![rule(
                serde_json::json!({"var": "b"}),
                serde_json::json!({"set": {"target": "c.isVisible", "value": true}}),
            )],
        );
        let graph = graph_for(&rs);
        let invalidated = graph.invalidated_fields(&["a".to_string()]);
        assert_eq!(
            invalidated,
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
        assert!(!invalidated.contains("a"));
    }

    #[test]
    fn empty_target_path_is_rejected() {
        assert!(matches!(
            target_field(""),
            Err(RuleError::InvalidTargetPath { .. })
        ));
        assert_eq!(target_field("a.isVisible").unwrap(), "a");
        assert_eq!(target_field("a").unwrap(), "a");
    }
}
