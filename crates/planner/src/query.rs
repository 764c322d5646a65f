//! Parsed query AST consumed by the plan builder.

use std::fmt;

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};
use svq_common::{Result, SvqError};

use crate::condition::Condition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl LiteralValue {
    pub fn data_type(&self) -> DataType {
        match self {
            LiteralValue::Int64(_) => DataType::Int64,
            LiteralValue::Float64(_) => DataType::Float64,
            LiteralValue::Utf8(_) => DataType::Utf8,
            LiteralValue::Boolean(_) => DataType::Boolean,
            LiteralValue::Null => DataType::Null,
        }
    }

    /// Unquoted text form, as handed to a service pipeline parameter.
    pub fn to_parameter_string(&self) -> String {
        match self {
            LiteralValue::Int64(v) => v.to_string(),
            LiteralValue::Float64(v) => v.to_string(),
            LiteralValue::Utf8(v) => v.clone(),
            LiteralValue::Boolean(v) => v.to_string(),
            LiteralValue::Null => String::new(),
        }
    }

    /// Convert to `to` where a lossless or textual conversion exists.
    pub fn cast_to(&self, to: &DataType) -> Result<LiteralValue> {
        let out = match (self, to) {
            (v, t) if &v.data_type() == t => v.clone(),
            (LiteralValue::Null, _) => LiteralValue::Null,
            (_, DataType::Utf8) => LiteralValue::Utf8(self.to_parameter_string()),
            (LiteralValue::Int64(v), DataType::Float64) => LiteralValue::Float64(*v as f64),
            (LiteralValue::Float64(v), DataType::Int64) if v.fract() == 0.0 => {
                LiteralValue::Int64(*v as i64)
            }
            (LiteralValue::Utf8(s), DataType::Int64) => {
                LiteralValue::Int64(s.trim().parse().map_err(|_| cast_error(self, to))?)
            }
            (LiteralValue::Utf8(s), DataType::Float64) => {
                LiteralValue::Float64(s.trim().parse().map_err(|_| cast_error(self, to))?)
            }
            (LiteralValue::Utf8(s), DataType::Boolean) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "y" | "1" => LiteralValue::Boolean(true),
                    "false" | "n" | "0" => LiteralValue::Boolean(false),
                    _ => return Err(cast_error(self, to)),
                }
            }
            _ => return Err(cast_error(self, to)),
        };
        Ok(out)
    }
}

fn cast_error(v: &LiteralValue, to: &DataType) -> SvqError {
    SvqError::PlanConstruction(format!("cannot convert literal {v} to {to:?}"))
}

impl fmt::Display for LiteralValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiteralValue::Int64(v) => write!(f, "{v}"),
            LiteralValue::Float64(v) => write!(f, "{v}"),
            LiteralValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
            LiteralValue::Boolean(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            LiteralValue::Null => write!(f, "NULL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunction {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Count => "COUNT",
        };
        f.write_str(s)
    }
}

/// What an aggregate is computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateSubject {
    /// `COUNT(*)` or an aggregate with no explicit argument.
    Star,
    Field(String),
    /// `COUNT(1)`, `SUM(2)`: the literal is materialized by the constant stage.
    Constant(LiteralValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub function: AggregateFunction,
    pub subject: AggregateSubject,
    /// `COUNT(DISTINCT x)`.
    pub distinct: bool,
}

impl AggregateExpr {
    pub fn new(function: AggregateFunction, subject: AggregateSubject) -> Self {
        Self {
            function,
            subject,
            distinct: false,
        }
    }

    pub fn count_star() -> Self {
        Self::new(AggregateFunction::Count, AggregateSubject::Star)
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn is_count_star(&self) -> bool {
        self.function == AggregateFunction::Count && self.subject == AggregateSubject::Star
    }

    /// Generated column name used when the aggregate has no alias.
    pub fn display_name(&self) -> String {
        let arg = match &self.subject {
            AggregateSubject::Star => "*".to_string(),
            AggregateSubject::Field(f) => f.clone(),
            AggregateSubject::Constant(v) => v.to_string(),
        };
        if self.distinct {
            format!("{}(DISTINCT {arg})", self.function)
        } else {
            format!("{}({arg})", self.function)
        }
    }
}

/// One side of an IIF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IifValue {
    Field(String),
    Literal(LiteralValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IifExpr {
    pub condition: Condition,
    pub when_true: IifValue,
    pub when_false: IifValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectExpr {
    Field(String),
    Constant(LiteralValue),
    Aggregate(AggregateExpr),
    Iif(IifExpr),
}

/// A select-list (or order-list) entry.
///
/// `index` is unique across the select and order lists of one query; it keys
/// synthesized column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectField {
    pub expr: SelectExpr,
    pub alias: Option<String>,
    pub index: usize,
}

impl SelectField {
    pub fn new(expr: SelectExpr, index: usize) -> Self {
        Self {
            expr,
            alias: None,
            index,
        }
    }

    pub fn field(name: impl Into<String>, index: usize) -> Self {
        Self::new(SelectExpr::Field(name.into()), index)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name of the expression itself, ignoring the alias.
    pub fn name(&self) -> String {
        match &self.expr {
            SelectExpr::Field(f) => f.clone(),
            SelectExpr::Constant(_) => format!("constant_{}", self.index),
            SelectExpr::Aggregate(a) => a.display_name(),
            SelectExpr::Iif(_) => format!("iif_{}", self.index),
        }
    }

    /// Column carrying this field's value before the final projection.
    ///
    /// Plain fields keep their underlying name; synthesized columns (constants,
    /// aggregates, IIF targets) are created under the alias when there is one.
    pub fn column_name(&self) -> String {
        match &self.expr {
            SelectExpr::Field(f) => f.clone(),
            _ => self.alias.clone().unwrap_or_else(|| self.name()),
        }
    }

    /// Column name presented to the caller.
    pub fn output_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.name())
    }

    pub fn aggregate(&self) -> Option<&AggregateExpr> {
        match &self.expr {
            SelectExpr::Aggregate(a) => Some(a),
            _ => None,
        }
    }

    pub fn iif(&self) -> Option<&IifExpr> {
        match &self.expr {
            SelectExpr::Iif(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate().is_some()
    }

    /// Matches `name` against the expression name or the alias.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name() == name || self.alias.as_deref() == Some(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderField {
    pub field: SelectField,
    pub ascending: bool,
}

/// A parsed `SELECT ... FROM <service>` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Raw SQL text.
    pub sql: String,
    /// `None` for queries without a FROM clause.
    pub service: Option<String>,
    pub distinct: bool,
    pub select: Vec<SelectField>,
    /// GROUP BY field names.
    pub group_by: Vec<String>,
    pub order_by: Vec<OrderField>,
    pub where_condition: Option<Condition>,
    pub having: Option<Condition>,
    /// `LIMIT n` from the SQL text.
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(sql: impl Into<String>, service: Option<String>) -> Self {
        Self {
            sql: sql.into(),
            service,
            distinct: false,
            select: vec![],
            group_by: vec![],
            order_by: vec![],
            where_condition: None,
            having: None,
            limit: None,
        }
    }

    pub fn has_aggregates(&self) -> bool {
        self.select.iter().any(SelectField::is_aggregate)
    }

    /// Select-list entry answering to `name` (expression name or alias).
    pub fn find_select_field(&self, name: &str) -> Option<&SelectField> {
        self.select.iter().find(|f| f.answers_to(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_alias_rules() {
        let plain = SelectField::field("a", 0).with_alias("x");
        assert_eq!(plain.name(), "a");
        assert_eq!(plain.column_name(), "a");
        assert_eq!(plain.output_name(), "x");

        let agg = SelectField::new(SelectExpr::Aggregate(AggregateExpr::count_star()), 1);
        assert_eq!(agg.column_name(), "COUNT(*)");
        let agg = agg.with_alias("n");
        assert_eq!(agg.column_name(), "n");
        assert!(agg.answers_to("COUNT(*)"));
        assert!(agg.answers_to("n"));

        let constant = SelectField::new(SelectExpr::Constant(LiteralValue::Int64(1)), 2);
        assert_eq!(constant.column_name(), "constant_2");
    }

    #[test]
    fn literal_casts() {
        assert_eq!(
            LiteralValue::Utf8("42".into())
                .cast_to(&DataType::Int64)
                .expect("cast"),
            LiteralValue::Int64(42)
        );
        assert_eq!(
            LiteralValue::Int64(3).cast_to(&DataType::Utf8).expect("cast"),
            LiteralValue::Utf8("3".into())
        );
        assert!(LiteralValue::Utf8("x".into())
            .cast_to(&DataType::Float64)
            .is_err());
    }

    #[test]
    fn distinct_count_display_name() {
        let a = AggregateExpr::new(
            AggregateFunction::Count,
            AggregateSubject::Field("k".into()),
        )
        .distinct();
        assert_eq!(a.display_name(), "COUNT(DISTINCT k)");
    }
}
