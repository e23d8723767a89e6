//! The logic-tree expression language.
//!
//! A wire expression is a literal, an ordered array, or a single-key
//! object mapping an operator name to its operand(s). The "exactly one
//! operator key" invariant cannot be expressed by the wire format, so it
//! is enforced here at the parse boundary; past this point every node is
//! a typed variant and unknown operator names are carried in the
//! [`Expr::Custom`] fallthrough case for the evaluator's registry.
//!
//! The lookup sugar path `fieldPath@tableName.property` is desugared at
//! parse time into a canonical [`Expr::Lookup`] node, so the evaluator
//! and the dependency walker only ever see one form.

use crate::error::RuleError;
use crate::value::Value;

/// Arithmetic operators. `+` and `*` are variadic, `-` accepts one
/// (negation) or two operands, `/` is binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

/// Comparison operators. `==`/`!=` are strict value equality with no
/// text/number coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

/// Higher-order iteration operators. Their body operand stays
/// unevaluated until bound per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterOp {
    Some,
    Every,
    Map,
}

impl IterOp {
    pub fn name(self) -> &'static str {
        match self {
            IterOp::Some => "some",
            IterOp::Every => "every",
            IterOp::Map => "map",
        }
    }

    /// Result when the source operand does not reduce to a sequence.
    /// The body operand is not evaluated at all in that case.
    pub fn default_result(self) -> Value {
        match self {
            IterOp::Some => Value::Bool(false),
            IterOp::Every => Value::Bool(true),
            IterOp::Map => Value::List(vec![]),
        }
    }
}

/// A parsed logic expression. Immutable and freely clonable.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Ordered sequence; elements evaluate independently.
    Seq(Vec<Expr>),
    /// Dotted-path context read. `"$"` (or a leading `"$."`) reads the
    /// iteration-local binding. Missing paths read as Null.
    Var { path: String },
    /// Named shared-rule reference, expanded before evaluation.
    Ref { name: String },
    /// Keyed lookup-table read: table name, key expression, record
    /// property.
    Lookup {
        table: String,
        key: Box<Expr>,
        property: String,
    },
    Arith { op: ArithOp, args: Vec<Expr> },
    Compare { op: CompareOp, args: Vec<Expr> },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    /// condition / then / optional else (missing else reads as Null).
    If(Vec<Expr>),
    /// Higher-order iteration over a sequence.
    Iter {
        op: IterOp,
        source: Box<Expr>,
        body: Box<Expr>,
    },
    /// Any operator name outside the built-in set; resolved against the
    /// evaluator's custom registry at evaluation time.
    Custom { name: String, args: Vec<Expr> },
}

impl Expr {
    /// The wire operator name of this node, if it is an operator node.
    pub fn operator_name(&self) -> Option<&str> {
        match self {
            Expr::Literal(_) | Expr::Seq(_) => None,
            Expr::Var { .. } => Some("var"),
            Expr::Ref { .. } => Some("$ref"),
            Expr::Lookup { .. } => Some("lookup"),
            Expr::Arith { op, .. } => Some(op.name()),
            Expr::Compare { op, .. } => Some(op.name()),
            Expr::And(_) => Some("and"),
            Expr::Or(_) => Some("or"),
            Expr::Not(_) => Some("not"),
            Expr::If(_) => Some("if"),
            Expr::Iter { op, .. } => Some(op.name()),
            Expr::Custom { name, .. } => Some(name),
        }
    }

    /// Parse a wire-format JSON expression.
    pub fn from_json(v: &serde_json::Value) -> Result<Expr, RuleError> {
        match v {
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Expr::from_json(item)?);
                }
                Ok(Expr::Seq(out))
            }
            serde_json::Value::Object(obj) => {
                if obj.len() != 1 {
                    return Err(RuleError::MalformedExpression {
                        message: format!(
                            "operator node must carry exactly one key, got {}",
                            obj.len()
                        ),
                    });
                }
                let (op, operand) = obj.iter().next().expect("len checked above");
                Expr::parse_operator(op, operand)
            }
            other => Ok(Expr::Literal(Value::from_json(other)?)),
        }
    }

    fn parse_operator(op: &str, operand: &serde_json::Value) -> Result<Expr, RuleError> {
        match op {
            "var" => parse_var(operand),
            "$ref" => {
                let name = operand.as_str().ok_or_else(|| malformed("$ref expects a name"))?;
                Ok(Expr::Ref {
                    name: name.to_string(),
                })
            }
            "lookup" => parse_lookup(operand),
            "+" => parse_arith(ArithOp::Add, operand, 1, usize::MAX),
            "-" => parse_arith(ArithOp::Sub, operand, 1, 2),
            "*" => parse_arith(ArithOp::Mul, operand, 1, usize::MAX),
            "/" => parse_arith(ArithOp::Div, operand, 2, 2),
            ">" => parse_compare(CompareOp::Gt, operand),
            "<" => parse_compare(CompareOp::Lt, operand),
            ">=" => parse_compare(CompareOp::Ge, operand),
            "<=" => parse_compare(CompareOp::Le, operand),
            "==" => parse_compare(CompareOp::Eq, operand),
            "!=" => parse_compare(CompareOp::Ne, operand),
            "and" => Ok(Expr::And(operands(operand)?)),
            "or" => Ok(Expr::Or(operands(operand)?)),
            "not" => {
                let mut args = operands(operand)?;
                if args.len() != 1 {
                    return Err(malformed("not expects exactly one operand"));
                }
                Ok(Expr::Not(Box::new(args.remove(0))))
            }
            "if" => {
                let args = operands(operand)?;
                if args.len() != 2 && args.len() != 3 {
                    return Err(malformed("if expects two or three operands"));
                }
                Ok(Expr::If(args))
            }
            "some" => parse_iter(IterOp::Some, operand),
            "every" => parse_iter(IterOp::Every, operand),
            "map" => parse_iter(IterOp::Map, operand),
            _ => Ok(Expr::Custom {
                name: op.to_string(),
                args: operands(operand)?,
            }),
        }
    }
}

fn malformed(message: &str) -> RuleError {
    RuleError::MalformedExpression {
        message: message.to_string(),
    }
}

/// Operand list: an array parses element-wise, anything else is a single
/// operand.
fn operands(v: &serde_json::Value) -> Result<Vec<Expr>, RuleError> {
    match v {
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Expr::from_json(item)?);
            }
            Ok(out)
        }
        other => Ok(vec![Expr::from_json(other)?]),
    }
}

/// `var` accepts a path string or a one-element path array. A path
/// containing `@` is lookup sugar and desugars here.
fn parse_var(operand: &serde_json::Value) -> Result<Expr, RuleError> {
    let path = match operand {
        serde_json::Value::String(s) => s.as_str(),
        serde_json::Value::Array(items) => match items.as_slice() {
            [serde_json::Value::String(s)] => s.as_str(),
            _ => return Err(malformed("var expects a single path string")),
        },
        _ => return Err(malformed("var expects a path string")),
    };

    match path.split_once('@') {
        None => Ok(Expr::Var {
            path: path.to_string(),
        }),
        Some((field_path, table_and_property)) => {
            let (table, property) = table_and_property
                .split_once('.')
                .ok_or_else(|| malformed("lookup sugar expects path@table.property"))?;
            if field_path.is_empty() || table.is_empty() || property.is_empty() {
                return Err(malformed("lookup sugar expects path@table.property"));
            }
            Ok(Expr::Lookup {
                table: table.to_string(),
                key: Box::new(Expr::Var {
                    path: field_path.to_string(),
                }),
                property: property.to_string(),
            })
        }
    }
}

fn parse_lookup(operand: &serde_json::Value) -> Result<Expr, RuleError> {
    let items = operand
        .as_array()
        .filter(|items| items.len() == 3)
        .ok_or_else(|| malformed("lookup expects [table, keyExpr, property]"))?;
    let table = items[0]
        .as_str()
        .ok_or_else(|| malformed("lookup table name must be a string"))?;
    let property = items[2]
        .as_str()
        .ok_or_else(|| malformed("lookup property name must be a string"))?;
    Ok(Expr::Lookup {
        table: table.to_string(),
        key: Box::new(Expr::from_json(&items[1])?),
        property: property.to_string(),
    })
}

fn parse_arith(
    op: ArithOp,
    operand: &serde_json::Value,
    min: usize,
    max: usize,
) -> Result<Expr, RuleError> {
    let args = operands(operand)?;
    if args.len() < min || args.len() > max {
        return Err(malformed(&format!(
            "'{}' got {} operands",
            op.name(),
            args.len()
        )));
    }
    Ok(Expr::Arith { op, args })
}

fn parse_compare(op: CompareOp, operand: &serde_json::Value) -> Result<Expr, RuleError> {
    let args = operands(operand)?;
    if args.len() != 2 {
        return Err(malformed(&format!(
            "'{}' expects exactly two operands",
            op.name()
        )));
    }
    Ok(Expr::Compare { op, args })
}

fn parse_iter(op: IterOp, operand: &serde_json::Value) -> Result<Expr, RuleError> {
    let mut args = operands(operand)?;
    if args.len() != 2 {
        return Err(malformed(&format!(
            "'{}' expects [source, body]",
            op.name()
        )));
    }
    let body = args.pop().expect("len checked");
    let source = args.pop().expect("len checked");
    Ok(Expr::Iter {
        op,
        source: Box::new(source),
        body: Box::new(body),
    })
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
