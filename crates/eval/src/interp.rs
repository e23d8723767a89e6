//! Expression interpreter.
//!
//! Evaluates a parsed [`Expr`] against an evaluation context. The
//! interpreter is side-effect free: variable reads that miss resolve to
//! Null, lookup misses resolve to Null, and only structural problems
//! (unknown operators, unknown tables, strict-type arithmetic) raise.
//!
//! Custom operators registered by name shadow built-ins -- the registry
//! is always consulted first. The lazy iteration trio
//! (`some`/`every`/`map`) is the exception: a custom handler receives
//! resolved operand values, and resolving the body operand eagerly
//! would break the per-element `$` binding, so registration under those
//! names is rejected outright rather than silently ignored.

use std::collections::BTreeMap;

use formwork_core::{ArithOp, CompareOp, Expr, IterOp, LookupTable, RuleError, SharedRuleTable, Value};

use crate::numeric;

/// Evaluation context: the folded input/provider value map plus the
/// iteration-local `$` binding.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    values: BTreeMap<String, Value>,
    binding: Option<Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        EvalContext::default()
    }

    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        EvalContext {
            values,
            binding: None,
        }
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// The context extended with an iteration-local `$` binding.
    pub fn with_binding(&self, binding: Value) -> Self {
        EvalContext {
            values: self.values.clone(),
            binding: Some(binding),
        }
    }

    /// Dotted-path read. `"$"` and `"$."`-prefixed paths read the
    /// iteration binding. Missing keys at any depth read as Null.
    pub fn lookup(&self, path: &str) -> Value {
        if path == "$" {
            return self.binding.clone().unwrap_or(Value::Null);
        }
        if let Some(rest) = path.strip_prefix("$.") {
            return self
                .binding
                .as_ref()
                .and_then(|b| b.get_path(rest))
                .cloned()
                .unwrap_or(Value::Null);
        }
        match path.split_once('.') {
            None => self.values.get(path).cloned().unwrap_or(Value::Null),
            Some((head, rest)) => self
                .values
                .get(head)
                .and_then(|v| v.get_path(rest))
                .cloned()
                .unwrap_or(Value::Null),
        }
    }
}

/// Borrowed evaluation environment: shared rules for `$ref` expansion
/// and the registered lookup tables.
#[derive(Clone, Copy)]
pub struct EvalEnv<'a> {
    pub shared: &'a SharedRuleTable,
    pub lookups: &'a BTreeMap<String, LookupTable>,
}

/// A custom operator: a function of the resolved operand values and the
/// current context.
pub type OperatorFn = Box<dyn Fn(&[Value], &EvalContext) -> Result<Value, RuleError>>;

/// One node of a debug-evaluation trace.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalTrace {
    pub operator: String,
    pub operands: Vec<Value>,
    pub result: Value,
    pub children: Vec<EvalTrace>,
}

impl EvalTrace {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "operator": self.operator,
            "operands": self.operands.iter().map(Value::to_json).collect::<Vec<_>>(),
            "result": self.result.to_json(),
            "children": self.children.iter().map(EvalTrace::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Per-node bookkeeping while tracing. Empty and unused when tracing is
/// off.
#[derive(Default)]
struct NodeAcc {
    operands: Vec<Value>,
    children: Vec<EvalTrace>,
}

/// The expression interpreter with its custom-operator registry.
#[derive(Default)]
pub struct Interpreter {
    custom: BTreeMap<String, OperatorFn>,
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter::default()
    }

    /// Register (or replace) a custom operator. Built-in names may be
    /// shadowed; `some`/`every`/`map` are refused because their body
    /// operand must stay unevaluated.
    pub fn register_operator(
        &mut self,
        name: impl Into<String>,
        f: OperatorFn,
    ) -> Result<(), RuleError> {
        let name = name.into();
        if matches!(name.as_str(), "some" | "every" | "map") {
            return Err(RuleError::ReservedOperator { op: name });
        }
        self.custom.insert(name, f);
        Ok(())
    }

    pub fn has_operator(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Evaluate an expression.
    pub fn eval(
        &self,
        expr: &Expr,
        ctx: &EvalContext,
        env: EvalEnv<'_>,
    ) -> Result<Value, RuleError> {
        self.eval_node(expr, ctx, env, false).map(|(v, _)| v)
    }

    /// Evaluate and additionally produce a structured execution trace.
    /// The returned value is identical to [`Interpreter::eval`].
    pub fn eval_traced(
        &self,
        expr: &Expr,
        ctx: &EvalContext,
        env: EvalEnv<'_>,
    ) -> Result<(Value, EvalTrace), RuleError> {
        let (value, trace) = self.eval_node(expr, ctx, env, true)?;
        Ok((value, trace.expect("tracing was requested")))
    }

    fn eval_node(
        &self,
        expr: &Expr,
        ctx: &EvalContext,
        env: EvalEnv<'_>,
        traced: bool,
    ) -> Result<(Value, Option<EvalTrace>), RuleError> {
        // The custom registry shadows built-ins. The lazy trio can
        // never appear in it; registration under those names is
        // rejected.
        if let Some(name) = expr.operator_name() {
            if let Some(handler) = self.custom.get(name) {
                return self.eval_shadowed(name, handler, expr, ctx, env, traced);
            }
        }

        let mut acc = NodeAcc::default();
        match expr {
            Expr::Literal(v) => {
                if traced {
                    acc.operands.push(v.clone());
                }
                Ok(finish(traced, "literal", acc, v.clone()))
            }

            Expr::Seq(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_operand(item, ctx, env, traced, &mut acc)?);
                }
                Ok(finish(traced, "seq", acc, Value::List(values)))
            }

            Expr::Var { path } => {
                if traced {
                    acc.operands.push(Value::Text(path.clone()));
                }
                Ok(finish(traced, "var", acc, ctx.lookup(path)))
            }

            Expr::Ref { name } => {
                let resolved = env.shared.resolve(expr)?;
                if traced {
                    acc.operands.push(Value::Text(name.clone()));
                }
                let result = self.eval_operand(&resolved, ctx, env, traced, &mut acc)?;
                Ok(finish(traced, "$ref", acc, result))
            }

            Expr::Lookup {
                table,
                key,
                property,
            } => {
                let records = env.lookups.get(table).ok_or_else(|| {
                    RuleError::UnknownLookupTable {
                        table: table.clone(),
                    }
                })?;
                if traced {
                    acc.operands.push(Value::Text(table.clone()));
                }
                let key_value = self.eval_operand(key, ctx, env, traced, &mut acc)?;
                if traced {
                    acc.operands.push(Value::Text(property.clone()));
                }
                Ok(finish(traced, "lookup", acc, records.get(&key_value, property)))
            }

            Expr::Arith { op, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_operand(arg, ctx, env, traced, &mut acc)?);
                }
                let result = match op {
                    ArithOp::Add => numeric::add(&values)?,
                    ArithOp::Sub => numeric::sub(&values)?,
                    ArithOp::Mul => numeric::mul(&values)?,
                    ArithOp::Div => numeric::div(&values)?,
                };
                Ok(finish(traced, op.name(), acc, result))
            }

            Expr::Compare { op, args } => {
                let left = self.eval_operand(&args[0], ctx, env, traced, &mut acc)?;
                let right = self.eval_operand(&args[1], ctx, env, traced, &mut acc)?;
                let result = match op {
                    CompareOp::Eq => numeric::values_equal(&left, &right),
                    CompareOp::Ne => !numeric::values_equal(&left, &right),
                    CompareOp::Gt => numeric::compare_ordered(&left, &right)?.is_gt(),
                    CompareOp::Lt => numeric::compare_ordered(&left, &right)?.is_lt(),
                    CompareOp::Ge => numeric::compare_ordered(&left, &right)?.is_ge(),
                    CompareOp::Le => numeric::compare_ordered(&left, &right)?.is_le(),
                };
                Ok(finish(traced, op.name(), acc, Value::Bool(result)))
            }

            Expr::And(args) => {
                let mut result = Value::Bool(true);
                for arg in args {
                    result = self.eval_operand(arg, ctx, env, traced, &mut acc)?;
                    if !result.truthy() {
                        break;
                    }
                }
                Ok(finish(traced, "and", acc, result))
            }

            Expr::Or(args) => {
                let mut result = Value::Bool(false);
                for arg in args {
                    result = self.eval_operand(arg, ctx, env, traced, &mut acc)?;
                    if result.truthy() {
                        break;
                    }
                }
                Ok(finish(traced, "or", acc, result))
            }

            Expr::Not(arg) => {
                let value = self.eval_operand(arg, ctx, env, traced, &mut acc)?;
                Ok(finish(traced, "not", acc, Value::Bool(!value.truthy())))
            }

            Expr::If(args) => {
                let cond = self.eval_operand(&args[0], ctx, env, traced, &mut acc)?;
                let result = if cond.truthy() {
                    self.eval_operand(&args[1], ctx, env, traced, &mut acc)?
                } else if let Some(else_branch) = args.get(2) {
                    self.eval_operand(else_branch, ctx, env, traced, &mut acc)?
                } else {
                    Value::Null
                };
                Ok(finish(traced, "if", acc, result))
            }

            Expr::Iter { op, source, body } => {
                let source_value = self.eval_operand(source, ctx, env, traced, &mut acc)?;
                let Value::List(items) = source_value else {
                    // Not a sequence: fixed default, body never evaluated.
                    return Ok(finish(traced, op.name(), acc, op.default_result()));
                };
                let result = match op {
                    IterOp::Some => {
                        let mut found = false;
                        for item in items {
                            let bound = ctx.with_binding(item);
                            if self.eval_operand(body, &bound, env, traced, &mut acc)?.truthy() {
                                found = true;
                                break;
                            }
                        }
                        Value::Bool(found)
                    }
                    IterOp::Every => {
                        let mut all = true;
                        for item in items {
                            let bound = ctx.with_binding(item);
                            if !self.eval_operand(body, &bound, env, traced, &mut acc)?.truthy() {
                                all = false;
                                break;
                            }
                        }
                        Value::Bool(all)
                    }
                    IterOp::Map => {
                        let mut mapped = Vec::with_capacity(items.len());
                        for item in items {
                            let bound = ctx.with_binding(item);
                            mapped.push(self.eval_operand(body, &bound, env, traced, &mut acc)?);
                        }
                        Value::List(mapped)
                    }
                };
                Ok(finish(traced, op.name(), acc, result))
            }

            // Reached only when the registry lacks the name (the shadow
            // check above handles registered ones).
            Expr::Custom { name, .. } => Err(RuleError::UnknownOperator { op: name.clone() }),
        }
    }

    /// Dispatch to a registered operator, resolving operands first.
    fn eval_shadowed(
        &self,
        name: &str,
        handler: &OperatorFn,
        expr: &Expr,
        ctx: &EvalContext,
        env: EvalEnv<'_>,
        traced: bool,
    ) -> Result<(Value, Option<EvalTrace>), RuleError> {
        let mut acc = NodeAcc::default();
        let mut args = Vec::new();
        match expr {
            Expr::Var { path } => args.push(Value::Text(path.clone())),
            Expr::Ref { name } => args.push(Value::Text(name.clone())),
            Expr::Lookup {
                table,
                key,
                property,
            } => {
                args.push(Value::Text(table.clone()));
                args.push(self.eval_operand(key, ctx, env, traced, &mut acc)?);
                args.push(Value::Text(property.clone()));
            }
            Expr::Arith { args: operands, .. }
            | Expr::Compare { args: operands, .. }
            | Expr::And(operands)
            | Expr::Or(operands)
            | Expr::If(operands)
            | Expr::Custom { args: operands, .. } => {
                for operand in operands {
                    args.push(self.eval_operand(operand, ctx, env, traced, &mut acc)?);
                }
            }
            Expr::Not(operand) => {
                args.push(self.eval_operand(operand, ctx, env, traced, &mut acc)?);
            }
            Expr::Literal(_) | Expr::Seq(_) | Expr::Iter { .. } => {
                unreachable!("shadow dispatch is only entered for named, non-lazy operators")
            }
        }
        let result = handler(&args, ctx)?;
        if traced {
            acc.operands = args;
        }
        Ok(finish(traced, name, acc, result))
    }

    fn eval_operand(
        &self,
        expr: &Expr,
        ctx: &EvalContext,
        env: EvalEnv<'_>,
        traced: bool,
        acc: &mut NodeAcc,
    ) -> Result<Value, RuleError> {
        let (value, trace) = self.eval_node(expr, ctx, env, traced)?;
        if traced {
            acc.operands.push(value.clone());
            acc.children.push(trace.expect("tracing was requested"));
        }
        Ok(value)
    }
}

fn finish(
    traced: bool,
    operator: &str,
    acc: NodeAcc,
    result: Value,
) -> (Value, Option<EvalTrace>) {
    if !traced {
        return (result, None);
    }
    let trace = EvalTrace {
        operator: operator.to_string(),
        operands: acc.operands,
        result: result.clone(),
        children: acc.children,
    };
    (result, Some(trace))
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
