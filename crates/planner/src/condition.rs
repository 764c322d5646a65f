//! Boolean condition trees (WHERE / HAVING / IIF) and their index-bound form.

use std::fmt;

use serde::{Deserialize, Serialize};
use svq_common::{Result, SvqError};

use crate::query::{AggregateExpr, LiteralValue};
use crate::schema::RowSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Field(String),
    Literal(LiteralValue),
    /// Named pipeline parameter, resolved when a pipeline is instantiated.
    Parameter(String),
    /// Aggregate reference, only meaningful in HAVING.
    Aggregate(AggregateExpr),
    /// Right-hand side of `IN (...)`.
    List(Vec<LiteralValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    IsNull,
    IsNotNull,
    InList,
}

impl ComparisonOp {
    /// Unary operators ignore their right operand.
    pub fn is_unary(self) -> bool {
        matches!(self, ComparisonOp::IsNull | ComparisonOp::IsNotNull)
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
            ComparisonOp::Like => "LIKE",
            ComparisonOp::IsNull => "IS NULL",
            ComparisonOp::IsNotNull => "IS NOT NULL",
            ComparisonOp::InList => "IN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Atom {
        left: Operand,
        op: ComparisonOp,
        right: Operand,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn atom(left: Operand, op: ComparisonOp, right: Operand) -> Self {
        Condition::Atom { left, op, right }
    }

    /// `field <op> literal`
    pub fn compare(field: impl Into<String>, op: ComparisonOp, value: LiteralValue) -> Self {
        Self::atom(Operand::Field(field.into()), op, Operand::Literal(value))
    }

    /// Visit every operand in the tree, depth first.
    pub fn for_each_operand<'a>(&'a self, f: &mut dyn FnMut(&'a Operand)) {
        match self {
            Condition::Atom { left, right, .. } => {
                f(left);
                f(right);
            }
            Condition::And(children) | Condition::Or(children) => {
                for c in children {
                    c.for_each_operand(f);
                }
            }
            Condition::Not(inner) => inner.for_each_operand(f),
        }
    }

    /// Field names referenced anywhere in the tree.
    pub fn field_names(&self) -> Vec<&str> {
        let mut out = vec![];
        self.for_each_operand(&mut |op| {
            if let Operand::Field(name) = op {
                out.push(name.as_str());
            }
        });
        out
    }

    /// Aggregates referenced anywhere in the tree, in first-seen order.
    pub fn aggregates(&self) -> Vec<&AggregateExpr> {
        let mut out: Vec<&AggregateExpr> = vec![];
        self.for_each_operand(&mut |op| {
            if let Operand::Aggregate(a) = op {
                if !out.contains(&a) {
                    out.push(a);
                }
            }
        });
        out
    }

    /// Copy of the tree with every field reference renamed by `rename`.
    pub fn map_fields(&self, rename: &dyn Fn(&str) -> String) -> Condition {
        let operand = |op: &Operand| match op {
            Operand::Field(name) => Operand::Field(rename(name)),
            other => other.clone(),
        };
        match self {
            Condition::Atom { left, op, right } => Condition::Atom {
                left: operand(left),
                op: *op,
                right: operand(right),
            },
            Condition::And(children) => {
                Condition::And(children.iter().map(|c| c.map_fields(rename)).collect())
            }
            Condition::Or(children) => {
                Condition::Or(children.iter().map(|c| c.map_fields(rename)).collect())
            }
            Condition::Not(inner) => Condition::Not(Box::new(inner.map_fields(rename))),
        }
    }

    /// Resolve field references to column indices against `schema`.
    ///
    /// `aggregate_column` maps an aggregate reference to the column that holds
    /// its value; it is only consulted for HAVING conditions.
    pub fn bind(
        &self,
        schema: &RowSchema,
        aggregate_column: &dyn Fn(&AggregateExpr) -> Option<String>,
    ) -> Result<BoundCondition> {
        match self {
            Condition::Atom { left, op, right } => Ok(BoundCondition::Atom {
                left: bind_operand(left, schema, aggregate_column)?,
                op: *op,
                right: bind_operand(right, schema, aggregate_column)?,
            }),
            Condition::And(children) => Ok(BoundCondition::And(
                children
                    .iter()
                    .map(|c| c.bind(schema, aggregate_column))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Condition::Or(children) => Ok(BoundCondition::Or(
                children
                    .iter()
                    .map(|c| c.bind(schema, aggregate_column))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Condition::Not(inner) => Ok(BoundCondition::Not(Box::new(
                inner.bind(schema, aggregate_column)?,
            ))),
        }
    }

    /// Bind a condition that may not reference aggregates.
    pub fn bind_plain(&self, schema: &RowSchema) -> Result<BoundCondition> {
        self.bind(schema, &|_: &AggregateExpr| None)
    }
}

fn bind_operand(
    op: &Operand,
    schema: &RowSchema,
    aggregate_column: &dyn Fn(&AggregateExpr) -> Option<String>,
) -> Result<BoundOperand> {
    Ok(match op {
        Operand::Field(name) => BoundOperand::Column(schema.resolve(name)?),
        Operand::Literal(v) => BoundOperand::Literal(v.clone()),
        Operand::Parameter(p) => BoundOperand::Parameter(p.clone()),
        Operand::List(vs) => BoundOperand::List(vs.clone()),
        Operand::Aggregate(a) => {
            let column = aggregate_column(a).ok_or_else(|| {
                SvqError::Binding(format!(
                    "aggregate {} is not available here",
                    a.display_name()
                ))
            })?;
            BoundOperand::Column(schema.resolve(&column)?)
        }
    })
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Field(name) => f.write_str(name),
            Operand::Literal(v) => write!(f, "{v}"),
            Operand::Parameter(p) => write!(f, ":{p}"),
            Operand::Aggregate(a) => f.write_str(&a.display_name()),
            Operand::List(vs) => write!(f, "({})", join_literals(vs)),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Atom { left, op, .. } if op.is_unary() => write!(f, "{left} {op}"),
            Condition::Atom { left, op, right } => write!(f, "{left} {op} {right}"),
            Condition::And(children) => write_joined(f, children, " AND "),
            Condition::Or(children) => write_joined(f, children, " OR "),
            Condition::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[Condition], sep: &str) -> fmt::Result {
    let parts = children
        .iter()
        .map(|c| format!("({c})"))
        .collect::<Vec<_>>();
    f.write_str(&parts.join(sep))
}

fn join_literals(vs: &[LiteralValue]) -> String {
    vs.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundOperand {
    Column(usize),
    Literal(LiteralValue),
    Parameter(String),
    List(Vec<LiteralValue>),
}

/// Condition with every field reference resolved to an input column index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundCondition {
    Atom {
        left: BoundOperand,
        op: ComparisonOp,
        right: BoundOperand,
    },
    And(Vec<BoundCondition>),
    Or(Vec<BoundCondition>),
    Not(Box<BoundCondition>),
}

impl BoundCondition {
    /// Parameter names this condition needs at instantiation.
    pub fn parameters(&self) -> Vec<&str> {
        let mut out = vec![];
        self.collect_parameters(&mut out);
        out
    }

    fn collect_parameters<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            BoundCondition::Atom { left, right, .. } => {
                for op in [left, right] {
                    if let BoundOperand::Parameter(p) = op {
                        out.push(p.as_str());
                    }
                }
            }
            BoundCondition::And(cs) | BoundCondition::Or(cs) => {
                for c in cs {
                    c.collect_parameters(out);
                }
            }
            BoundCondition::Not(inner) => inner.collect_parameters(out),
        }
    }
}

impl fmt::Display for BoundOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundOperand::Column(i) => write!(f, "${i}"),
            BoundOperand::Literal(v) => write!(f, "{v}"),
            BoundOperand::Parameter(p) => write!(f, ":{p}"),
            BoundOperand::List(vs) => write!(f, "({})", join_literals(vs)),
        }
    }
}

impl fmt::Display for BoundCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundCondition::Atom { left, op, .. } if op.is_unary() => write!(f, "{left} {op}"),
            BoundCondition::Atom { left, op, right } => write!(f, "{left} {op} {right}"),
            BoundCondition::And(cs) => {
                let parts = cs.iter().map(|c| format!("({c})")).collect::<Vec<_>>();
                f.write_str(&parts.join(" AND "))
            }
            BoundCondition::Or(cs) => {
                let parts = cs.iter().map(|c| format!("({c})")).collect::<Vec<_>>();
                f.write_str(&parts.join(" OR "))
            }
            BoundCondition::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::AggregateFunction;
    use crate::schema::ColumnDef;
    use arrow_schema::DataType;

    fn schema() -> RowSchema {
        RowSchema::new(vec![
            ColumnDef::new("a", DataType::Int64),
            ColumnDef::new("b", DataType::Utf8),
        ])
        .expect("schema")
    }

    #[test]
    fn binds_fields_to_indices() {
        let c = Condition::And(vec![
            Condition::compare("b", ComparisonOp::Eq, LiteralValue::Utf8("x".into())),
            Condition::compare("a", ComparisonOp::Gt, LiteralValue::Int64(1)),
        ]);
        let bound = c.bind_plain(&schema()).expect("bind");
        assert_eq!(bound.to_string(), "($1 = 'x') AND ($0 > 1)");
    }

    #[test]
    fn unknown_field_is_binding_error() {
        let c = Condition::compare("zz", ComparisonOp::Eq, LiteralValue::Int64(1));
        assert!(matches!(c.bind_plain(&schema()), Err(SvqError::Binding(_))));
    }

    #[test]
    fn aggregate_operands_go_through_resolver() {
        let c = Condition::atom(
            Operand::Aggregate(AggregateExpr::count_star()),
            ComparisonOp::Gt,
            Operand::Literal(LiteralValue::Int64(1)),
        );
        assert!(matches!(c.bind_plain(&schema()), Err(SvqError::Binding(_))));
        let bound = c
            .bind(&schema(), &|a: &AggregateExpr| {
                (a.function == AggregateFunction::Count).then(|| "a".to_string())
            })
            .expect("bind");
        assert_eq!(bound.to_string(), "$0 > 1");
    }

    #[test]
    fn collects_parameters() {
        let c = Condition::atom(
            Operand::Field("b".into()),
            ComparisonOp::Eq,
            Operand::Parameter("region".into()),
        );
        let bound = c.bind_plain(&schema()).expect("bind");
        assert_eq!(bound.parameters(), vec!["region"]);
    }
}
