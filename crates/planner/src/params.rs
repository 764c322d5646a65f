use std::collections::BTreeMap;

use crate::condition::{ComparisonOp, Condition, Operand};

/// Collect `field = literal` atoms reachable through AND nodes only.
///
/// The result maps field name to the literal's text and is handed to the
/// service pipeline as parameters. An equality under OR or NOT does not hold
/// for every result row, so those subtrees are never visited.
pub fn extract_parameters(condition: &Condition) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    collect(condition, &mut out);
    out
}

fn collect(condition: &Condition, out: &mut BTreeMap<String, String>) {
    match condition {
        Condition::Atom {
            left,
            op: ComparisonOp::Eq,
            right,
        } => match (left, right) {
            (Operand::Field(name), Operand::Literal(v))
            | (Operand::Literal(v), Operand::Field(name)) => {
                out.insert(name.clone(), v.to_parameter_string());
            }
            _ => {}
        },
        Condition::And(children) => {
            for c in children {
                collect(c, out);
            }
        }
        Condition::Atom { .. } | Condition::Or(_) | Condition::Not(_) => {}
    }
}
