//! Rule ordering and priority-conflict validation.
//!
//! Rules execute in ascending priority, ties broken by declared order.
//! Two distinct rules on the same field that share a priority AND a
//! target path are a conflict, raised unconditionally at load time:
//! whether their conditions could ever both be true at runtime is not
//! consulted.

use std::collections::{BTreeMap, BTreeSet};

use formwork_core::{FieldRule, RuleError, RuleSet};

use crate::actions::ActionDispatcher;

/// Stable ascending sort by priority. Declaration order breaks ties.
pub fn sort_by_priority(rules: &mut [&FieldRule]) {
    rules.sort_by_key(|rule| rule.priority);
}

/// Check one field's rules for same-priority target collisions.
pub fn validate_no_priority_conflicts(
    field: &str,
    rules: &[FieldRule],
    dispatcher: &ActionDispatcher,
) -> Result<(), RuleError> {
    // (priority, target) -> how many distinct rules write it.
    let mut seen: BTreeMap<(i64, String), usize> = BTreeMap::new();
    for rule in rules {
        // A single rule writing one target twice (a batch) is fine;
        // dedupe within the rule before counting.
        let targets: BTreeSet<String> =
            dispatcher.targets(field, &rule.action).into_iter().collect();
        for target in targets {
            let count = seen.entry((rule.priority, target.clone())).or_insert(0);
            *count += 1;
            if *count > 1 {
                return Err(RuleError::PriorityConflict {
                    field: field.to_string(),
                    target,
                    priority: rule.priority,
                });
            }
        }
    }
    Ok(())
}

/// Run the conflict check across every field of a rule set.
pub fn validate_rule_set(
    rule_set: &RuleSet,
    dispatcher: &ActionDispatcher,
) -> Result<(), RuleError> {
    for (field, rules) in rule_set.iter() {
        validate_no_priority_conflicts(field, rules, dispatcher)?;
    }
    Ok(())
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use formwork_core::{Action, Expr};

    fn rule(priority: i64, action: serde_json::Value) -> FieldRule {
        FieldRule {
            condition: Expr::from_json(&serde_json::json!(true)).unwrap(),
            action: Action::from_json("a", &action).unwrap(),
            priority,
            description: None,
        }
    }

    #[test]
    fn sort_is_stable_across_equal_priorities() {
        let first = rule(2, serde_json::json!({"set": {"target": "a.x", "value": 1}}));
        let second = rule(1, serde_json::json!({"set": {"target": "a.y", "value": 2}}));
        let third = rule(2, serde_json::json!({"set": {"target": "a.z", "value": 3}}));
        let mut refs = vec![&first, &second, &third];
        sort_by_priority(&mut refs);
        let targets: Vec<_> = refs
            .iter()
            .map(|r| match &r.action {
                Action::Set { target, .. } => target.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(targets, vec!["a.y", "a.x", "a.z"]);
    }

    #[test]
    fn same_priority_same_target_is_a_conflict() {
        let rules = vec![
            rule(1, serde_json::json!({"set": {"target": "a.isVisible", "value": true}})),
            rule(1, serde_json::json!({"set": {"target": "a.isVisible", "value": false}})),
        ];
        let err =
            validate_no_priority_conflicts("a", &rules, &ActionDispatcher::new()).unwrap_err();
        assert_eq!(
            err,
            RuleError::PriorityConflict {
                field: "a".to_string(),
                target: "a.isVisible".to_string(),
                priority: 1,
            }
        );
    }

    #[test]
    fn different_priorities_do_not_conflict() {
        let rules = vec![
            rule(1, serde_json::json!({"set": {"target": "a.isVisible", "value": true}})),
            rule(2, serde_json::json!({"set": {"target": "a.isVisible", "value": false}})),
        ];
        assert!(validate_no_priority_conflicts("a", &rules, &ActionDispatcher::new()).is_ok());
    }

    #[test]
    fn same_priority_different_targets_do_not_conflict() {
        let rules = vec![
            rule(1, serde_json::json!({"set": {"target": "a.isVisible", "value": true}})),
            rule(1, serde_json::json!({"set": {"target": "a.isRequired", "value": true}})),
        ];
        assert!(validate_no_priority_conflicts("a", &rules, &ActionDispatcher::new()).is_ok());
    }

    #[test]
    fn batch_targets_count_once_per_rule() {
        // One rule touching the same target twice is not a conflict with
        // itself.
        let rules = vec![rule(
            1,
            serde_json::json!({"batch": [
                {"set": {"target": "a.isVisible", "value": true}},
                {"set": {"target": "a.isVisible", "value": false}}
            ]}),
        )];
        assert!(validate_no_priority_conflicts("a", &rules, &ActionDispatcher::new()).is_ok());
    }

    #[test]
    fn conflicts_are_raised_even_with_disjoint_conditions() {
        let make = |cond: serde_json::Value| FieldRule {
            condition: Expr::from_json(&cond).unwrap(),
            action: Action::from_json(
                "a",
                &serde_json::json!({"set": {"target": "a.isVisible", "value": true}}),
            )
            .unwrap(),
            priority: 3,
            description: None,
        };
        let rules = vec![
            make(serde_json::json!({"==": [{"var": "b"}, 1]})),
            make(serde_json::json!({"==": [{"var": "b"}, 2]})),
        ];
        let err =
            validate_no_priority_conflicts("a", &rules, &ActionDispatcher::new()).unwrap_err();
        assert!(matches!(err, RuleError::PriorityConflict { .. }));
    }
}
