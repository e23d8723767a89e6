//! Strict numeric helpers over `i64` and `rust_decimal::Decimal`.
//!
//! All arithmetic is checked; overflow and division by zero surface as
//! errors, never panics. Operands must already be numeric: `+` on text
//! is a type mismatch, never concatenation. Int-only operations stay
//! Int; anything mixed promotes to Decimal.

use formwork_core::{RuleError, Value};
use rust_decimal::Decimal;

enum Num {
    Int(i64),
    Dec(Decimal),
}

fn as_number(v: &Value) -> Result<Num, RuleError> {
    match v {
        Value::Int(i) => Ok(Num::Int(*i)),
        Value::Decimal(d) => Ok(Num::Dec(*d)),
        other => Err(RuleError::TypeMismatch {
            expected: "number".to_string(),
            got: other.type_name().to_string(),
        }),
    }
}

fn as_decimal(v: &Value) -> Result<Decimal, RuleError> {
    match as_number(v)? {
        Num::Int(i) => Ok(Decimal::from(i)),
        Num::Dec(d) => Ok(d),
    }
}

fn overflow(op: &str) -> RuleError {
    RuleError::Overflow {
        message: format!("{} overflow", op),
    }
}

/// Variadic sum.
pub fn add(args: &[Value]) -> Result<Value, RuleError> {
    fold(args, "addition", i64::checked_add, Decimal::checked_add)
}

/// Variadic product.
pub fn mul(args: &[Value]) -> Result<Value, RuleError> {
    fold(args, "multiplication", i64::checked_mul, Decimal::checked_mul)
}

/// One operand negates; two subtract.
pub fn sub(args: &[Value]) -> Result<Value, RuleError> {
    match args {
        [single] => match as_number(single)? {
            Num::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| overflow("negation")),
            Num::Dec(d) => Ok(Value::Decimal(-d)),
        },
        [left, right] => fold(&[left.clone(), right.clone()], "subtraction", i64::checked_sub, Decimal::checked_sub),
        _ => Err(RuleError::TypeMismatch {
            expected: "one or two operands".to_string(),
            got: format!("{} operands", args.len()),
        }),
    }
}

/// Binary division. Always Decimal, so `1 / 2` is `0.5`.
pub fn div(args: &[Value]) -> Result<Value, RuleError> {
    let [left, right] = args else {
        return Err(RuleError::TypeMismatch {
            expected: "two operands".to_string(),
            got: format!("{} operands", args.len()),
        });
    };
    let dividend = as_decimal(left)?;
    let divisor = as_decimal(right)?;
    if divisor.is_zero() {
        return Err(RuleError::Overflow {
            message: "division by zero".to_string(),
        });
    }
    dividend
        .checked_div(divisor)
        .map(Value::Decimal)
        .ok_or_else(|| overflow("division"))
}

fn fold(
    args: &[Value],
    op: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    dec_op: fn(Decimal, Decimal) -> Option<Decimal>,
) -> Result<Value, RuleError> {
    let mut iter = args.iter();
    let first = iter.next().ok_or_else(|| RuleError::TypeMismatch {
        expected: "at least one operand".to_string(),
        got: "0 operands".to_string(),
    })?;
    let mut acc = as_number(first)?;
    for arg in iter {
        acc = match (acc, as_number(arg)?) {
            (Num::Int(a), Num::Int(b)) => Num::Int(int_op(a, b).ok_or_else(|| overflow(op))?),
            (a, b) => {
                let a = match a {
                    Num::Int(i) => Decimal::from(i),
                    Num::Dec(d) => d,
                };
                let b = match b {
                    Num::Int(i) => Decimal::from(i),
                    Num::Dec(d) => d,
                };
                Num::Dec(dec_op(a, b).ok_or_else(|| overflow(op))?)
            }
        };
    }
    Ok(match acc {
        Num::Int(i) => Value::Int(i),
        Num::Dec(d) => Value::Decimal(d),
    })
}

/// Strict value equality. No text/number coercion; Int and Decimal
/// holding the same number compare equal.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Ok(a), Ok(b)) => {
            let a = match a {
                Num::Int(i) => Decimal::from(i),
                Num::Dec(d) => d,
            };
            let b = match b {
                Num::Int(i) => Decimal::from(i),
                Num::Dec(d) => d,
            };
            a == b
        }
        _ => left == right,
    }
}

/// Ordering comparison: numbers against numbers, text against text.
pub fn compare_ordered(left: &Value, right: &Value) -> Result<std::cmp::Ordering, RuleError> {
    match (left, right) {
        (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
        _ => {
            let a = as_decimal(left)?;
            let b = as_decimal(right)?;
            Ok(a.cmp(&b))
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_arithmetic_stays_int() {
        let result = add(&[Value::Int(2), Value::Int(3), Value::Int(5)]).unwrap();
        assert_eq!(result, Value::Int(10));
    }

    #[test]
    fn mixed_arithmetic_promotes_to_decimal() {
        let result = add(&[Value::Int(1), Value::Decimal(Decimal::new(5, 1))]).unwrap();
        assert_eq!(result, Value::Decimal(Decimal::new(15, 1)));
    }

    #[test]
    fn addition_on_text_is_type_mismatch() {
        let err = add(&[Value::Text("a".to_string()), Value::Text("b".to_string())]).unwrap_err();
        assert!(matches!(err, RuleError::TypeMismatch { .. }));
    }

    #[test]
    fn unary_minus_negates() {
        assert_eq!(sub(&[Value::Int(7)]).unwrap(), Value::Int(-7));
    }

    #[test]
    fn division_is_decimal() {
        let result = div(&[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(result, Value::Decimal(Decimal::new(5, 1)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = div(&[Value::Int(1), Value::Int(0)]).unwrap_err();
        assert!(matches!(err, RuleError::Overflow { .. }));
    }

    #[test]
    fn integer_overflow_is_an_error() {
        let err = add(&[Value::Int(i64::MAX), Value::Int(1)]).unwrap_err();
        assert!(matches!(err, RuleError::Overflow { .. }));
    }

    #[test]
    fn equality_is_strict_but_numeric_across_int_and_decimal() {
        assert!(values_equal(&Value::Int(1), &Value::Decimal(Decimal::ONE)));
        assert!(!values_equal(&Value::Int(1), &Value::Text("1".to_string())));
        assert!(!values_equal(&Value::Bool(true), &Value::Int(1)));
    }

    #[test]
    fn ordering_mixes_numbers_not_text() {
        assert_eq!(
            compare_ordered(&Value::Int(2), &Value::Decimal(Decimal::new(25, 1))).unwrap(),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            compare_ordered(
                &Value::Text("a".to_string()),
                &Value::Text("b".to_string())
            )
            .unwrap(),
            std::cmp::Ordering::Less
        );
        let err = compare_ordered(&Value::Text("a".to_string()), &Value::Int(1)).unwrap_err();
        assert!(matches!(err, RuleError::TypeMismatch { .. }));
    }
}
