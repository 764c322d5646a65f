//! Row-at-a-time evaluation of bound conditions.
//!
//! Logic is two-valued: any comparison involving NULL is false, so
//! `NOT (x = 1)` is true for a NULL `x`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use arrow_schema::DataType;
use svq_common::{Result, SvqError};
use svq_planner::{BoundCondition, BoundOperand, ComparisonOp, LiteralValue};

use crate::value::ScalarValue;

/// Replace every parameter operand by its value from `params`.
///
/// Parameter values are text; comparisons coerce them against numeric
/// columns at evaluation time.
pub fn resolve_parameters(
    condition: &BoundCondition,
    params: &BTreeMap<String, String>,
) -> Result<BoundCondition> {
    let resolve = |op: &BoundOperand| -> Result<BoundOperand> {
        match op {
            BoundOperand::Parameter(name) => params
                .get(name)
                .map(|v| BoundOperand::Literal(LiteralValue::Utf8(v.clone())))
                .ok_or_else(|| {
                    SvqError::Execution(format!("no value for pipeline parameter '{name}'"))
                }),
            other => Ok(other.clone()),
        }
    };
    Ok(match condition {
        BoundCondition::Atom { left, op, right } => BoundCondition::Atom {
            left: resolve(left)?,
            op: *op,
            right: resolve(right)?,
        },
        BoundCondition::And(cs) => BoundCondition::And(
            cs.iter()
                .map(|c| resolve_parameters(c, params))
                .collect::<Result<Vec<_>>>()?,
        ),
        BoundCondition::Or(cs) => BoundCondition::Or(
            cs.iter()
                .map(|c| resolve_parameters(c, params))
                .collect::<Result<Vec<_>>>()?,
        ),
        BoundCondition::Not(inner) => {
            BoundCondition::Not(Box::new(resolve_parameters(inner, params)?))
        }
    })
}

/// Evaluate `condition` against one row.
pub fn evaluate(condition: &BoundCondition, row: &[ScalarValue]) -> Result<bool> {
    match condition {
        BoundCondition::Atom { left, op, right } => evaluate_atom(left, *op, right, row),
        BoundCondition::And(cs) => {
            for c in cs {
                if !evaluate(c, row)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        BoundCondition::Or(cs) => {
            for c in cs {
                if evaluate(c, row)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        BoundCondition::Not(inner) => Ok(!evaluate(inner, row)?),
    }
}

fn evaluate_atom(
    left: &BoundOperand,
    op: ComparisonOp,
    right: &BoundOperand,
    row: &[ScalarValue],
) -> Result<bool> {
    let l = operand_value(left, row)?;
    match op {
        ComparisonOp::IsNull => return Ok(l.is_null()),
        ComparisonOp::IsNotNull => return Ok(!l.is_null()),
        ComparisonOp::InList => {
            let BoundOperand::List(items) = right else {
                return Err(SvqError::Execution(format!(
                    "IN expects a literal list, got {right}"
                )));
            };
            return Ok(items
                .iter()
                .any(|item| compare(&l, &ScalarValue::from(item)) == Some(Ordering::Equal)));
        }
        _ => {}
    }
    let r = operand_value(right, row)?;
    if op == ComparisonOp::Like {
        return Ok(match (l.as_text(), r.as_text()) {
            (Some(text), Some(pattern)) => like(&text, &pattern),
            _ => false,
        });
    }
    let Some(ord) = compare(&l, &r) else {
        return Ok(false);
    };
    Ok(match op {
        ComparisonOp::Eq => ord == Ordering::Equal,
        ComparisonOp::NotEq => ord != Ordering::Equal,
        ComparisonOp::Lt => ord == Ordering::Less,
        ComparisonOp::LtEq => ord != Ordering::Greater,
        ComparisonOp::Gt => ord == Ordering::Greater,
        ComparisonOp::GtEq => ord != Ordering::Less,
        ComparisonOp::Like | ComparisonOp::IsNull | ComparisonOp::IsNotNull | ComparisonOp::InList => {
            false
        }
    })
}

fn operand_value(op: &BoundOperand, row: &[ScalarValue]) -> Result<ScalarValue> {
    match op {
        BoundOperand::Column(i) => row.get(*i).cloned().ok_or_else(|| {
            SvqError::Execution(format!(
                "column ${i} out of range for a row of {} values",
                row.len()
            ))
        }),
        BoundOperand::Literal(v) => Ok(ScalarValue::from(v)),
        BoundOperand::Parameter(name) => Err(SvqError::Execution(format!(
            "unresolved pipeline parameter '{name}'"
        ))),
        BoundOperand::List(_) => Err(SvqError::Execution(
            "a literal list is only valid on the right of IN".to_string(),
        )),
    }
}

/// SQL comparison with numeric coercion; `None` when either side is NULL or
/// the values are not comparable.
pub fn compare(l: &ScalarValue, r: &ScalarValue) -> Option<Ordering> {
    use ScalarValue::*;
    match (l, r) {
        (Null, _) | (_, Null) => None,
        (Int64(a), Int64(b)) => Some(a.cmp(b)),
        (Utf8(a), Utf8(b)) => Some(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (Boolean(_), _) | (_, Boolean(_)) => {
            match (l.cast_to(&DataType::Boolean).ok()?, r.cast_to(&DataType::Boolean).ok()?) {
                (Boolean(a), Boolean(b)) => Some(a.cmp(&b)),
                _ => None,
            }
        }
        _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
    }
}

/// `LIKE` with `%` (any run) and `_` (any single character).
pub fn like(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut ti, mut pi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '%' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            ti += 1;
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(col: usize, op: ComparisonOp, v: LiteralValue) -> BoundCondition {
        BoundCondition::Atom {
            left: BoundOperand::Column(col),
            op,
            right: BoundOperand::Literal(v),
        }
    }

    #[test]
    fn like_patterns() {
        assert!(like("hello", "h%o"));
        assert!(like("hello", "_ello"));
        assert!(like("hello", "%"));
        assert!(like("", "%"));
        assert!(!like("hello", "h_o"));
        assert!(like("abcabc", "%bc"));
        assert!(!like("abc", "abcd"));
        // a literal '%' in the text does not consume a wildcard
        assert!(like("%abc", "%c"));
        assert!(like("%x", "%"));
        assert!(like("50%", "5_%"));
        assert!(!like("%ab", "%c"));
    }

    #[test]
    fn numeric_coercion_and_nulls() {
        let row = vec![ScalarValue::Int64(5), ScalarValue::Null, ScalarValue::from("10")];
        assert!(evaluate(&atom(0, ComparisonOp::Lt, LiteralValue::Float64(5.5)), &row).expect("eval"));
        assert!(evaluate(&atom(2, ComparisonOp::Gt, LiteralValue::Int64(9)), &row).expect("eval"));
        assert!(!evaluate(&atom(1, ComparisonOp::Eq, LiteralValue::Null), &row).expect("eval"));
        let is_null = BoundCondition::Atom {
            left: BoundOperand::Column(1),
            op: ComparisonOp::IsNull,
            right: BoundOperand::Literal(LiteralValue::Null),
        };
        assert!(evaluate(&is_null, &row).expect("eval"));
    }

    #[test]
    fn in_list_and_boolean_connectives() {
        let row = vec![ScalarValue::Int64(2), ScalarValue::from("eu")];
        let in_list = BoundCondition::Atom {
            left: BoundOperand::Column(0),
            op: ComparisonOp::InList,
            right: BoundOperand::List(vec![LiteralValue::Int64(1), LiteralValue::Int64(2)]),
        };
        let c = BoundCondition::And(vec![
            in_list,
            BoundCondition::Not(Box::new(atom(1, ComparisonOp::Eq, LiteralValue::Utf8("us".into())))),
        ]);
        assert!(evaluate(&c, &row).expect("eval"));
        let c = BoundCondition::Or(vec![
            atom(0, ComparisonOp::Gt, LiteralValue::Int64(10)),
            atom(1, ComparisonOp::Like, LiteralValue::Utf8("e%".into())),
        ]);
        assert!(evaluate(&c, &row).expect("eval"));
    }

    #[test]
    fn parameters_resolve_to_text() {
        let c = BoundCondition::Atom {
            left: BoundOperand::Column(0),
            op: ComparisonOp::Eq,
            right: BoundOperand::Parameter("id".into()),
        };
        let mut params = BTreeMap::new();
        assert!(resolve_parameters(&c, &params).is_err());
        params.insert("id".to_string(), "7".to_string());
        let resolved = resolve_parameters(&c, &params).expect("resolve");
        assert!(evaluate(&resolved, &[ScalarValue::Int64(7)]).expect("eval"));
        assert!(matches!(
            evaluate(&c, &[ScalarValue::Int64(7)]),
            Err(SvqError::Execution(_))
        ));
    }
}
