//! Rules, actions, shared rules, and lookup tables.
//!
//! Structural validation (condition/action present, integer priority,
//! single-key action objects) happens here at the JSON boundary; past it
//! every rule is well-formed by construction. Rule sets are replaced
//! wholesale by the engine, never partially mutated.

use std::collections::BTreeMap;

use crate::error::RuleError;
use crate::expr::Expr;
use crate::value::Value;

// ──────────────────────────────────────────────
// Actions
// ──────────────────────────────────────────────

/// A tagged action. Built-in variants carry typed payloads; anything
/// else is carried as [`Action::Custom`] for the dispatcher's registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write a literal value to a target property path.
    Set { target: String, value: Value },
    /// Resolve `source` as a context read and write it to `target`.
    Copy { source: String, target: String },
    /// Evaluate `formula` and write the result to `target`.
    Calculate { target: String, formula: Expr },
    /// Fire an external event with a literal parameter payload.
    Trigger { event: String, params: Value },
    /// Execute sub-actions in literal order, with no isolation.
    Batch(Vec<Action>),
    /// One-time field initialization, gated by the engine's
    /// already-initialized marker.
    Init {
        field_state: Option<BTreeMap<String, Value>>,
        field_value: Option<Value>,
    },
    /// A registered custom action type with an opaque payload.
    Custom { action_type: String, payload: Value },
}

impl Action {
    /// The wire tag of this action.
    pub fn type_name(&self) -> &str {
        match self {
            Action::Set { .. } => "set",
            Action::Copy { .. } => "copy",
            Action::Calculate { .. } => "calculate",
            Action::Trigger { .. } => "trigger",
            Action::Batch(_) => "batch",
            Action::Init { .. } => "init",
            Action::Custom { action_type, .. } => action_type,
        }
    }

    pub fn is_init(&self) -> bool {
        matches!(self, Action::Init { .. })
    }

    /// Parse a wire-format action object: exactly one key mapping the
    /// action type to its payload.
    pub fn from_json(field: &str, v: &serde_json::Value) -> Result<Action, RuleError> {
        let obj = v.as_object().ok_or_else(|| invalid(field, "action must be an object"))?;
        if obj.len() != 1 {
            return Err(invalid(
                field,
                &format!("action must carry exactly one type key, got {}", obj.len()),
            ));
        }
        let (tag, payload) = obj.iter().next().expect("len checked above");
        match tag.as_str() {
            "set" => Ok(Action::Set {
                target: payload_str(field, payload, "target")?,
                value: payload_value(payload, "value")?,
            }),
            "copy" => Ok(Action::Copy {
                source: payload_str(field, payload, "source")?,
                target: payload_str(field, payload, "target")?,
            }),
            "calculate" => {
                let formula = payload
                    .get("formula")
                    .ok_or_else(|| invalid(field, "calculate requires a formula"))?;
                Ok(Action::Calculate {
                    target: payload_str(field, payload, "target")?,
                    formula: Expr::from_json(formula)?,
                })
            }
            "trigger" => Ok(Action::Trigger {
                event: payload_str(field, payload, "event")?,
                params: payload_value(payload, "params")?,
            }),
            "batch" => {
                let items = payload
                    .as_array()
                    .ok_or_else(|| invalid(field, "batch requires an action array"))?;
                let mut actions = Vec::with_capacity(items.len());
                for item in items {
                    actions.push(Action::from_json(field, item)?);
                }
                Ok(Action::Batch(actions))
            }
            "init" => {
                let field_state = match payload.get("fieldState") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(serde_json::Value::Object(obj)) => {
                        let mut state = BTreeMap::new();
                        for (k, val) in obj {
                            state.insert(k.clone(), Value::from_json(val)?);
                        }
                        Some(state)
                    }
                    Some(_) => return Err(invalid(field, "init fieldState must be an object")),
                };
                let field_value = match payload.get("fieldValue") {
                    None => None,
                    Some(val) => Some(Value::from_json(val)?),
                };
                Ok(Action::Init {
                    field_state,
                    field_value,
                })
            }
            other => Ok(Action::Custom {
                action_type: other.to_string(),
                payload: Value::from_json(payload)?,
            }),
        }
    }

    /// The action's payload in value form, as handed to an overriding
    /// handler registered under a built-in type name.
    pub fn payload(&self) -> Value {
        match self {
            Action::Set { target, value } => {
                let mut m = BTreeMap::new();
                m.insert("target".to_string(), Value::Text(target.clone()));
                m.insert("value".to_string(), value.clone());
                Value::Map(m)
            }
            Action::Copy { source, target } => {
                let mut m = BTreeMap::new();
                m.insert("source".to_string(), Value::Text(source.clone()));
                m.insert("target".to_string(), Value::Text(target.clone()));
                Value::Map(m)
            }
            Action::Calculate { target, .. } => {
                // The formula is a parsed tree; overriding handlers see
                // the target only and must re-register a visitor if they
                // need the formula's reads.
                let mut m = BTreeMap::new();
                m.insert("target".to_string(), Value::Text(target.clone()));
                Value::Map(m)
            }
            Action::Trigger { event, params } => {
                let mut m = BTreeMap::new();
                m.insert("event".to_string(), Value::Text(event.clone()));
                m.insert("params".to_string(), params.clone());
                Value::Map(m)
            }
            Action::Batch(_) => Value::Null,
            Action::Init {
                field_state,
                field_value,
            } => {
                let mut m = BTreeMap::new();
                if let Some(state) = field_state {
                    m.insert("fieldState".to_string(), Value::Map(state.clone()));
                }
                if let Some(value) = field_value {
                    m.insert("fieldValue".to_string(), value.clone());
                }
                Value::Map(m)
            }
            Action::Custom { payload, .. } => payload.clone(),
        }
    }
}

fn invalid(field: &str, message: &str) -> RuleError {
    RuleError::InvalidRuleStructure {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn payload_str(field: &str, payload: &serde_json::Value, key: &str) -> Result<String, RuleError> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| invalid(field, &format!("action requires a string '{}'", key)))
}

fn payload_value(payload: &serde_json::Value, key: &str) -> Result<Value, RuleError> {
    match payload.get(key) {
        None => Ok(Value::Null),
        Some(v) => Value::from_json(v),
    }
}

// ──────────────────────────────────────────────
// Rules and rule sets
// ──────────────────────────────────────────────

/// One rule scoped to a field: condition + action + priority.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub condition: Expr,
    pub action: Action,
    pub priority: i64,
    pub description: Option<String>,
}

impl FieldRule {
    /// Parse and structurally validate one rule.
    pub fn from_json(field: &str, v: &serde_json::Value) -> Result<FieldRule, RuleError> {
        let obj = v.as_object().ok_or_else(|| invalid(field, "rule must be an object"))?;
        let condition = obj
            .get("condition")
            .ok_or_else(|| invalid(field, "rule missing condition"))?;
        let action = obj
            .get("action")
            .ok_or_else(|| invalid(field, "rule missing action"))?;
        let priority = obj
            .get("priority")
            .and_then(|p| p.as_i64())
            .ok_or_else(|| invalid(field, "rule priority must be an integer"))?;
        let description = obj
            .get("description")
            .and_then(|d| d.as_str())
            .map(str::to_owned);
        Ok(FieldRule {
            condition: Expr::from_json(condition)?,
            action: Action::from_json(field, action)?,
            priority,
            description,
        })
    }
}

/// All rules, keyed by field name. Owned by the engine and replaced
/// wholesale on load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: BTreeMap<String, Vec<FieldRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet::default()
    }

    /// Parse a wire-format rule set: `{field: [rule, ...]}`.
    pub fn from_json(v: &serde_json::Value) -> Result<RuleSet, RuleError> {
        let obj = v.as_object().ok_or_else(|| RuleError::InvalidRuleStructure {
            field: String::new(),
            message: "rule set must be an object".to_string(),
        })?;
        let mut rules = BTreeMap::new();
        for (field, rule_list) in obj {
            let items = rule_list
                .as_array()
                .ok_or_else(|| invalid(field, "field rules must be an array"))?;
            let mut parsed = Vec::with_capacity(items.len());
            for item in items {
                parsed.push(FieldRule::from_json(field, item)?);
            }
            rules.insert(field.clone(), parsed);
        }
        Ok(RuleSet { rules })
    }

    pub fn insert(&mut self, field: impl Into<String>, rules: Vec<FieldRule>) {
        self.rules.insert(field.into(), rules);
    }

    pub fn get(&self, field: &str) -> &[FieldRule] {
        self.rules.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether this field carries any rules (as opposed to being a
    /// dependency-only input).
    pub fn owns_rules(&self, field: &str) -> bool {
        self.rules.get(field).is_some_and(|r| !r.is_empty())
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.rules.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<FieldRule>)> {
        self.rules.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ──────────────────────────────────────────────
// Shared rules
// ──────────────────────────────────────────────

/// Named reusable expression fragments referenced via `$ref`.
#[derive(Debug, Clone, Default)]
pub struct SharedRuleTable {
    rules: BTreeMap<String, Expr>,
}

impl SharedRuleTable {
    pub fn new() -> Self {
        SharedRuleTable::default()
    }

    pub fn from_json(v: &serde_json::Value) -> Result<SharedRuleTable, RuleError> {
        let obj = v
            .as_object()
            .ok_or_else(|| RuleError::MalformedExpression {
                message: "shared rule table must be an object".to_string(),
            })?;
        let mut table = SharedRuleTable::new();
        for (name, expr) in obj {
            table.register(name.clone(), Expr::from_json(expr)?);
        }
        Ok(table)
    }

    pub fn register(&mut self, name: impl Into<String>, expr: Expr) {
        self.rules.insert(name.into(), expr);
    }

    /// Additive merge; incoming names overwrite existing ones.
    pub fn merge(&mut self, other: SharedRuleTable) {
        self.rules.extend(other.rules);
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.rules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Expand every `$ref` in an expression, recursively. A name still
    /// being expanded may not be referenced again within the same
    /// expansion.
    pub fn resolve(&self, expr: &Expr) -> Result<Expr, RuleError> {
        let mut expanding = Vec::new();
        self.resolve_inner(expr, &mut expanding)
    }

    fn resolve_inner(&self, expr: &Expr, expanding: &mut Vec<String>) -> Result<Expr, RuleError> {
        match expr {
            Expr::Ref { name } => {
                if expanding.iter().any(|n| n == name) {
                    return Err(RuleError::CircularDependency {
                        field: name.clone(),
                    });
                }
                let inner = self.rules.get(name).ok_or_else(|| {
                    RuleError::UnknownSharedRule { name: name.clone() }
                })?;
                expanding.push(name.clone());
                let resolved = self.resolve_inner(inner, expanding)?;
                expanding.pop();
                Ok(resolved)
            }
            Expr::Literal(_) | Expr::Var { .. } => Ok(expr.clone()),
            Expr::Seq(items) => Ok(Expr::Seq(self.resolve_all(items, expanding)?)),
            Expr::Lookup {
                table,
                key,
                property,
            } => Ok(Expr::Lookup {
                table: table.clone(),
                key: Box::new(self.resolve_inner(key, expanding)?),
                property: property.clone(),
            }),
            Expr::Arith { op, args } => Ok(Expr::Arith {
                op: *op,
                args: self.resolve_all(args, expanding)?,
            }),
            Expr::Compare { op, args } => Ok(Expr::Compare {
                op: *op,
                args: self.resolve_all(args, expanding)?,
            }),
            Expr::And(args) => Ok(Expr::And(self.resolve_all(args, expanding)?)),
            Expr::Or(args) => Ok(Expr::Or(self.resolve_all(args, expanding)?)),
            Expr::Not(arg) => Ok(Expr::Not(Box::new(self.resolve_inner(arg, expanding)?))),
            Expr::If(args) => Ok(Expr::If(self.resolve_all(args, expanding)?)),
            Expr::Iter { op, source, body } => Ok(Expr::Iter {
                op: *op,
                source: Box::new(self.resolve_inner(source, expanding)?),
                body: Box::new(self.resolve_inner(body, expanding)?),
            }),
            Expr::Custom { name, args } => Ok(Expr::Custom {
                name: name.clone(),
                args: self.resolve_all(args, expanding)?,
            }),
        }
    }

    fn resolve_all(
        &self,
        exprs: &[Expr],
        expanding: &mut Vec<String>,
    ) -> Result<Vec<Expr>, RuleError> {
        let mut out = Vec::with_capacity(exprs.len());
        for e in exprs {
            out.push(self.resolve_inner(e, expanding)?);
        }
        Ok(out)
    }
}

// ──────────────────────────────────────────────
// Lookup tables
// ──────────────────────────────────────────────

/// An ordered flat dataset addressable by a primary-key property.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    key: String,
    records: Vec<BTreeMap<String, Value>>,
}

impl LookupTable {
    pub fn new(key: impl Into<String>, records: Vec<BTreeMap<String, Value>>) -> Self {
        LookupTable {
            key: key.into(),
            records,
        }
    }

    /// Parse records from a wire-format array of flat objects.
    pub fn from_json(
        key: impl Into<String>,
        records: &serde_json::Value,
    ) -> Result<LookupTable, RuleError> {
        let items = records
            .as_array()
            .ok_or_else(|| RuleError::MalformedExpression {
                message: "lookup table records must be an array".to_string(),
            })?;
        let mut parsed = Vec::with_capacity(items.len());
        for item in items {
            match Value::from_json(item)? {
                Value::Map(m) => parsed.push(m),
                other => {
                    return Err(RuleError::MalformedExpression {
                        message: format!("lookup record must be an object, got {}", other.type_name()),
                    })
                }
            }
        }
        Ok(LookupTable::new(key, parsed))
    }

    /// First record whose key property equals `key_value`, in declared
    /// order.
    pub fn find(&self, key_value: &Value) -> Option<&BTreeMap<String, Value>> {
        self.records
            .iter()
            .find(|record| record.get(&self.key) == Some(key_value))
    }

    /// Property read on the matching record. Missing row or missing
    /// property reads as Null, never an error.
    pub fn get(&self, key_value: &Value, property: &str) -> Value {
        self.find(key_value)
            .and_then(|record| record.get(property))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
