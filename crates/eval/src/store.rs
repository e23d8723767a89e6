//! Field state and the validity cache.
//!
//! Each field carries a property map. Fresh fields start from the
//! built-in defaults (`isVisible`/`isRequired` false, `calculatedValue`
//! null), optionally overlaid with a host-supplied default factory.
//! A field's entry is either valid (its snapshot can be served without
//! re-evaluating) or invalid; the engine flips the flag, the store just
//! records it.

use std::collections::{BTreeMap, BTreeSet};

use formwork_core::{RuleError, Value};

/// Host hook producing extra default properties for a field.
pub type DefaultStateFn = Box<dyn Fn(&str) -> BTreeMap<String, Value>>;

pub struct FieldStateStore {
    states: BTreeMap<String, BTreeMap<String, Value>>,
    valid: BTreeSet<String>,
    default_factory: Option<DefaultStateFn>,
}

impl Default for FieldStateStore {
    fn default() -> Self {
        FieldStateStore {
            states: BTreeMap::new(),
            valid: BTreeSet::new(),
            default_factory: None,
        }
    }
}

impl FieldStateStore {
    pub fn new() -> Self {
        FieldStateStore::default()
    }

    /// Override the default properties new fields start from. The
    /// factory's output is merged over the built-in defaults.
    pub fn set_default_factory(&mut self, factory: DefaultStateFn) {
        self.default_factory = factory.into();
    }

    fn default_state(&self, field: &str) -> BTreeMap<String, Value> {
        let mut state = BTreeMap::from([
            ("isVisible".to_string(), Value::Bool(false)),
            ("isRequired".to_string(), Value::Bool(false)),
            ("calculatedValue".to_string(), Value::Null),
        ]);
        if let Some(factory) = &self.default_factory {
            state.extend(factory(field));
        }
        state
    }

    /// Create the field's entry from defaults if it has none.
    pub fn ensure(&mut self, field: &str) {
        if !self.states.contains_key(field) {
            let state = self.default_state(field);
            self.states.insert(field.to_string(), state);
        }
    }

    /// Put the field back to its default state and drop its validity.
    pub fn reset(&mut self, field: &str) {
        let state = self.default_state(field);
        self.states.insert(field.to_string(), state);
        self.valid.remove(field);
    }

    pub fn get(&self, field: &str) -> Option<&BTreeMap<String, Value>> {
        self.states.get(field)
    }

    /// The field's current property map, defaults if never touched.
    pub fn snapshot(&self, field: &str) -> BTreeMap<String, Value> {
        self.states
            .get(field)
            .cloned()
            .unwrap_or_else(|| self.default_state(field))
    }

    /// Write a (possibly dotted) property path, auto-vivifying nested
    /// maps. Traversing through a non-map value is an error.
    pub fn set(&mut self, field: &str, path: &str, value: Value) -> Result<(), RuleError> {
        let invalid = || RuleError::InvalidTargetPath {
            path: format!("{}.{}", field, path),
        };
        let defaults = self.default_state(field);
        let state = self.states.entry(field.to_string()).or_insert(defaults);

        let mut segments = path.split('.');
        let first = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(invalid)?;
        let rest: Vec<&str> = segments.collect();
        let Some((last, intermediate)) = rest.split_last() else {
            state.insert(first.to_string(), value);
            return Ok(());
        };

        let mut current = state
            .entry(first.to_string())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        for segment in intermediate {
            let map = match current {
                Value::Map(map) => map,
                _ => return Err(invalid()),
            };
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
        }
        match current {
            Value::Map(map) => {
                map.insert(last.to_string(), value);
                Ok(())
            }
            _ => Err(invalid()),
        }
    }

    pub fn mark_valid(&mut self, field: &str) {
        self.valid.insert(field.to_string());
    }

    pub fn invalidate(&mut self, field: &str) {
        self.valid.remove(field);
    }

    /// Drop every validity flag, keeping all state. Returns the fields
    /// that were valid.
    pub fn invalidate_all(&mut self) -> Vec<String> {
        std::mem::take(&mut self.valid).into_iter().collect()
    }

    pub fn is_valid(&self, field: &str) -> bool {
        self.valid.contains(field)
    }

    /// Drop all state and validity.
    pub fn clear_all(&mut self) {
        self.states.clear();
        self.valid.clear();
    }

    /// All materialized field states, in field order.
    pub fn iter_states(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, Value>)> {
        self.states.iter().map(|(k, v)| (k.as_str(), v))
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_fields_start_from_defaults() {
        let mut store = FieldStateStore::new();
        store.ensure("a");
        let state = store.get("a").unwrap();
        assert_eq!(state.get("isVisible"), Some(&Value::Bool(false)));
        assert_eq!(state.get("isRequired"), Some(&Value::Bool(false)));
        assert_eq!(state.get("calculatedValue"), Some(&Value::Null));
    }

    #[test]
    fn host_defaults_overlay_builtins() {
        let mut store = FieldStateStore::new();
        store.set_default_factory(Box::new(|_| {
            BTreeMap::from([
                ("isVisible".to_string(), Value::Bool(true)),
                ("hint".to_string(), Value::Text("".to_string())),
            ])
        }));
        store.ensure("a");
        let state = store.get("a").unwrap();
        assert_eq!(state.get("isVisible"), Some(&Value::Bool(true)));
        assert_eq!(state.get("hint"), Some(&Value::Text("".to_string())));
        assert_eq!(state.get("calculatedValue"), Some(&Value::Null));
    }

    #[test]
    fn dotted_writes_auto_vivify() {
        let mut store = FieldStateStore::new();
        store.set("a", "meta.ui.width", Value::Int(80)).unwrap();
        let state = store.get("a").unwrap();
        let Some(Value::Map(meta)) = state.get("meta") else {
            panic!("meta should be a map");
        };
        let Some(Value::Map(ui)) = meta.get("ui") else {
            panic!("ui should be a map");
        };
        assert_eq!(ui.get("width"), Some(&Value::Int(80)));
    }

    #[test]
    fn writing_through_a_scalar_is_rejected() {
        let mut store = FieldStateStore::new();
        store.set("a", "calculatedValue", Value::Int(1)).unwrap();
        let err = store
            .set("a", "calculatedValue.nested", Value::Int(2))
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidTargetPath { .. }));
    }

    #[test]
    fn reset_restores_defaults_and_drops_validity() {
        let mut store = FieldStateStore::new();
        store.set("a", "isVisible", Value::Bool(true)).unwrap();
        store.mark_valid("a");
        store.reset("a");
        assert!(!store.is_valid("a"));
        assert_eq!(
            store.get("a").unwrap().get("isVisible"),
            Some(&Value::Bool(false))
        );
    }

    #[test]
    fn invalidate_all_keeps_state_and_reports_valid_fields() {
        let mut store = FieldStateStore::new();
        store.set("a", "isVisible", Value::Bool(true)).unwrap();
        store.mark_valid("a");
        store.mark_valid("b");

        let dropped = store.invalidate_all();
        assert_eq!(dropped, vec!["a".to_string(), "b".to_string()]);
        assert!(!store.is_valid("a"));
        assert_eq!(
            store.get("a").unwrap().get("isVisible"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn snapshot_of_untouched_field_is_defaults() {
        let store = FieldStateStore::new();
        let snap = store.snapshot("never");
        assert_eq!(snap.get("isVisible"), Some(&Value::Bool(false)));
        assert!(store.get("never").is_none());
    }
}
