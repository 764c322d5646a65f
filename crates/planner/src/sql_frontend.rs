use sqlparser::ast::{
    BinaryOperator as SqlBinaryOp, Distinct, DuplicateTreatment, Expr as SqlExpr, Function,
    FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, ObjectName,
    Query as SqlQuery, SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value,
};
use svq_common::{Result, SvqError};

use crate::condition::{ComparisonOp, Condition, Operand};
use crate::query::{
    AggregateExpr, AggregateFunction, AggregateSubject, IifExpr, IifValue, LiteralValue,
    OrderField, Query, SelectExpr, SelectField,
};

/// Parse one `SELECT` statement into a [`Query`].
///
/// Supported subset: one service in FROM (or none), plain fields, literals,
/// `IIF(cond, a, b)`, `SUM/MIN/MAX/AVG/COUNT` with optional DISTINCT,
/// WHERE, GROUP BY, HAVING, ORDER BY, LIMIT and `SELECT DISTINCT`.
/// Named placeholders (`:region`) in conditions become pipeline parameters.
pub fn sql_to_query(sql: &str) -> Result<Query> {
    let stmts = svq_sql::parse_sql(sql)?;
    if stmts.len() != 1 {
        return Err(SvqError::Unsupported(
            "only single-statement SQL is supported".to_string(),
        ));
    }
    match &stmts[0] {
        Statement::Query(q) => query_from_sql(sql, q),
        _ => Err(SvqError::Unsupported(
            "only SELECT queries are supported".to_string(),
        )),
    }
}

fn query_from_sql(sql: &str, q: &SqlQuery) -> Result<Query> {
    let select = match &*q.body {
        SetExpr::Select(s) => s.as_ref(),
        _ => {
            return Err(SvqError::Unsupported(
                "only simple SELECT is supported (no UNION/EXCEPT/INTERSECT)".to_string(),
            ))
        }
    };
    if q.offset.is_some() {
        return Err(SvqError::Unsupported("OFFSET is not supported".to_string()));
    }

    let service = match select.from.as_slice() {
        [] => None,
        [twj] if twj.joins.is_empty() => match &twj.relation {
            TableFactor::Table { name, .. } => Some(object_name_to_string(name)),
            _ => {
                return Err(SvqError::Unsupported(
                    "FROM must name a single service".to_string(),
                ))
            }
        },
        _ => {
            return Err(SvqError::Unsupported(
                "joins and multiple FROM sources are not supported".to_string(),
            ))
        }
    };

    let mut query = Query::new(sql, service);
    query.distinct = match &select.distinct {
        None => false,
        Some(Distinct::Distinct) => true,
        Some(Distinct::On(_)) => {
            return Err(SvqError::Unsupported(
                "SELECT DISTINCT ON is not supported".to_string(),
            ))
        }
    };

    for (index, item) in select.projection.iter().enumerate() {
        let field = match item {
            SelectItem::UnnamedExpr(e) => SelectField::new(select_expr(e)?, index),
            SelectItem::ExprWithAlias { expr, alias } => {
                SelectField::new(select_expr(expr)?, index).with_alias(alias.value.clone())
            }
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                return Err(SvqError::Unsupported(
                    "SELECT * is not supported (list the fields explicitly)".to_string(),
                ))
            }
        };
        query.select.push(field);
    }

    if let Some(selection) = &select.selection {
        query.where_condition = Some(condition(selection)?);
    }

    query.group_by = match &select.group_by {
        GroupByExpr::Expressions(es, _mods) => es
            .iter()
            .map(|e| {
                field_name(e).ok_or_else(|| {
                    SvqError::Unsupported(format!("GROUP BY supports field names only, got {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?,
        GroupByExpr::All(_mods) => {
            return Err(SvqError::Unsupported(
                "GROUP BY ALL is not supported".to_string(),
            ))
        }
    };

    if let Some(having) = &select.having {
        query.having = Some(condition(having)?);
    }

    if let Some(order_by) = &q.order_by {
        let offset = query.select.len();
        for (i, o) in order_by.exprs.iter().enumerate() {
            query.order_by.push(OrderField {
                field: SelectField::new(select_expr(&o.expr)?, offset + i),
                ascending: o.asc.unwrap_or(true),
            });
        }
    }

    if let Some(limit) = &q.limit {
        query.limit = Some(limit_to_usize(limit)?);
    }
    Ok(query)
}

fn select_expr(e: &SqlExpr) -> Result<SelectExpr> {
    if let Some(name) = field_name(e) {
        return Ok(SelectExpr::Field(name));
    }
    match e {
        SqlExpr::Nested(inner) => select_expr(inner),
        SqlExpr::Function(f) => match function_name(f).as_str() {
            "IIF" => Ok(SelectExpr::Iif(iif(f)?)),
            _ => match aggregate(f)? {
                Some(a) => Ok(SelectExpr::Aggregate(a)),
                None => Err(SvqError::Unsupported(format!("unsupported function: {e}"))),
            },
        },
        _ => match literal(e)? {
            Some(v) => Ok(SelectExpr::Constant(v)),
            None => Err(SvqError::Unsupported(format!(
                "unsupported select expression: {e}"
            ))),
        },
    }
}

fn iif(f: &Function) -> Result<IifExpr> {
    let args = function_args(f)?;
    let [cond, when_true, when_false] = args else {
        return Err(SvqError::Unsupported(format!(
            "IIF takes exactly three arguments, got {}",
            args.len()
        )));
    };
    Ok(IifExpr {
        condition: condition(arg_expr(cond, "IIF")?)?,
        when_true: iif_value(arg_expr(when_true, "IIF")?)?,
        when_false: iif_value(arg_expr(when_false, "IIF")?)?,
    })
}

fn iif_value(e: &SqlExpr) -> Result<IifValue> {
    if let Some(name) = field_name(e) {
        return Ok(IifValue::Field(name));
    }
    match literal(e)? {
        Some(v) => Ok(IifValue::Literal(v)),
        None => Err(SvqError::Unsupported(format!(
            "IIF values must be fields or literals, got {e}"
        ))),
    }
}

fn aggregate(f: &Function) -> Result<Option<AggregateExpr>> {
    let function = match function_name(f).as_str() {
        "SUM" => AggregateFunction::Sum,
        "MIN" => AggregateFunction::Min,
        "MAX" => AggregateFunction::Max,
        "AVG" => AggregateFunction::Avg,
        "COUNT" => AggregateFunction::Count,
        _ => return Ok(None),
    };
    let distinct = matches!(
        &f.args,
        FunctionArguments::List(list)
            if list.duplicate_treatment == Some(DuplicateTreatment::Distinct)
    );
    let subject = match function_args(f)? {
        [] | [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)] => AggregateSubject::Star,
        [FunctionArg::Unnamed(FunctionArgExpr::Expr(e))] => match field_name(e) {
            Some(name) => AggregateSubject::Field(name),
            None => match literal(e)? {
                Some(v) => AggregateSubject::Constant(v),
                None => {
                    return Err(SvqError::Unsupported(format!(
                        "{function} argument must be a field, a literal or *, got {e}"
                    )))
                }
            },
        },
        _ => {
            return Err(SvqError::Unsupported(format!(
                "{function} takes a single argument"
            )))
        }
    };
    if distinct && function != AggregateFunction::Count {
        return Err(SvqError::Unsupported(format!(
            "DISTINCT is only supported inside COUNT, not {function}"
        )));
    }
    Ok(Some(AggregateExpr {
        function,
        subject,
        distinct,
    }))
}

fn condition(e: &SqlExpr) -> Result<Condition> {
    match e {
        SqlExpr::Nested(inner) => condition(inner),
        SqlExpr::BinaryOp { left, op, right } => match op {
            SqlBinaryOp::And => Ok(Condition::And(flatten(
                condition(left)?,
                condition(right)?,
                true,
            ))),
            SqlBinaryOp::Or => Ok(Condition::Or(flatten(
                condition(left)?,
                condition(right)?,
                false,
            ))),
            _ => Ok(Condition::atom(
                operand(left)?,
                comparison_op(op)?,
                operand(right)?,
            )),
        },
        SqlExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Condition::Not(Box::new(condition(expr)?))),
        SqlExpr::IsNull(inner) => Ok(Condition::atom(
            operand(inner)?,
            ComparisonOp::IsNull,
            Operand::Literal(LiteralValue::Null),
        )),
        SqlExpr::IsNotNull(inner) => Ok(Condition::atom(
            operand(inner)?,
            ComparisonOp::IsNotNull,
            Operand::Literal(LiteralValue::Null),
        )),
        SqlExpr::Like {
            negated,
            expr,
            pattern,
            ..
        } => {
            let atom = Condition::atom(operand(expr)?, ComparisonOp::Like, operand(pattern)?);
            Ok(negate_if(atom, *negated))
        }
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => {
            let values = list
                .iter()
                .map(|item| {
                    literal(item)?.ok_or_else(|| {
                        SvqError::Unsupported(format!("IN lists take literals only, got {item}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let atom = Condition::atom(operand(expr)?, ComparisonOp::InList, Operand::List(values));
            Ok(negate_if(atom, *negated))
        }
        _ => Err(SvqError::Unsupported(format!(
            "unsupported condition: {e}"
        ))),
    }
}

/// Merge nested AND (or OR) chains into one n-ary node.
fn flatten(left: Condition, right: Condition, and: bool) -> Vec<Condition> {
    let mut out = vec![];
    for c in [left, right] {
        match c {
            Condition::And(children) if and => out.extend(children),
            Condition::Or(children) if !and => out.extend(children),
            other => out.push(other),
        }
    }
    out
}

fn negate_if(c: Condition, negated: bool) -> Condition {
    if negated {
        Condition::Not(Box::new(c))
    } else {
        c
    }
}

fn operand(e: &SqlExpr) -> Result<Operand> {
    if let Some(name) = field_name(e) {
        return Ok(Operand::Field(name));
    }
    match e {
        SqlExpr::Nested(inner) => operand(inner),
        SqlExpr::Value(Value::Placeholder(ph)) => Ok(Operand::Parameter(normalize_placeholder_key(ph))),
        SqlExpr::Function(f) => match aggregate(f)? {
            Some(a) => Ok(Operand::Aggregate(a)),
            None => Err(SvqError::Unsupported(format!(
                "unsupported function in condition: {e}"
            ))),
        },
        _ => match literal(e)? {
            Some(v) => Ok(Operand::Literal(v)),
            None => Err(SvqError::Unsupported(format!(
                "unsupported operand in condition: {e}"
            ))),
        },
    }
}

fn comparison_op(op: &SqlBinaryOp) -> Result<ComparisonOp> {
    Ok(match op {
        SqlBinaryOp::Eq => ComparisonOp::Eq,
        SqlBinaryOp::NotEq => ComparisonOp::NotEq,
        SqlBinaryOp::Lt => ComparisonOp::Lt,
        SqlBinaryOp::LtEq => ComparisonOp::LtEq,
        SqlBinaryOp::Gt => ComparisonOp::Gt,
        SqlBinaryOp::GtEq => ComparisonOp::GtEq,
        _ => {
            return Err(SvqError::Unsupported(format!(
                "unsupported comparison operator: {op}"
            )))
        }
    })
}

/// Literal value of `e`, or `None` when `e` is not a literal.
fn literal(e: &SqlExpr) -> Result<Option<LiteralValue>> {
    match e {
        SqlExpr::Nested(inner) => literal(inner),
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match &**expr {
            SqlExpr::Value(Value::Number(s, _)) => number(&format!("-{s}")).map(Some),
            _ => Ok(None),
        },
        SqlExpr::Value(v) => match v {
            Value::Number(s, _) => number(s).map(Some),
            Value::SingleQuotedString(s) => Ok(Some(LiteralValue::Utf8(s.clone()))),
            Value::Boolean(b) => Ok(Some(LiteralValue::Boolean(*b))),
            Value::Null => Ok(Some(LiteralValue::Null)),
            _ => Err(SvqError::Unsupported(format!("unsupported SQL literal: {v}"))),
        },
        _ => Ok(None),
    }
}

fn number(s: &str) -> Result<LiteralValue> {
    let bad = || SvqError::Unsupported(format!("bad number: {s}"));
    if s.contains(['.', 'e', 'E']) {
        Ok(LiteralValue::Float64(s.parse().map_err(|_| bad())?))
    } else {
        Ok(LiteralValue::Int64(s.parse().map_err(|_| bad())?))
    }
}

fn limit_to_usize(e: &SqlExpr) -> Result<usize> {
    match literal(e)? {
        Some(LiteralValue::Int64(i)) if i >= 0 => Ok(i as usize),
        Some(LiteralValue::Int64(_)) => {
            Err(SvqError::Unsupported("LIMIT must be non-negative".to_string()))
        }
        _ => Err(SvqError::Unsupported(
            "LIMIT must be a literal integer".to_string(),
        )),
    }
}

fn function_name(f: &Function) -> String {
    object_name_to_string(&f.name).to_uppercase()
}

fn function_args(f: &Function) -> Result<&[FunctionArg]> {
    match &f.args {
        FunctionArguments::List(list) => Ok(&list.args),
        FunctionArguments::None => Ok(&[][..]),
        FunctionArguments::Subquery(_) => Err(SvqError::Unsupported(format!(
            "subquery arguments are not supported: {}",
            f.name
        ))),
    }
}

fn arg_expr<'a>(a: &'a FunctionArg, function: &str) -> Result<&'a SqlExpr> {
    match a {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e),
        _ => Err(SvqError::Unsupported(format!(
            "unsupported argument form in {function}: {a}"
        ))),
    }
}

fn field_name(e: &SqlExpr) -> Option<String> {
    match e {
        SqlExpr::Identifier(id) => Some(id.value.clone()),
        SqlExpr::CompoundIdentifier(parts) => Some(compound_ident_to_string(parts)),
        _ => None,
    }
}

fn object_name_to_string(n: &ObjectName) -> String {
    compound_ident_to_string(&n.0)
}

fn compound_ident_to_string(parts: &[Ident]) -> String {
    parts
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

fn normalize_placeholder_key(ph: &str) -> String {
    let s = ph.trim();
    let s = s.strip_prefix(':').unwrap_or(s);
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_where_order_limit() {
        let q = sql_to_query("SELECT a, b AS label FROM sales WHERE region = 'EU' AND amount > 10 ORDER BY a DESC LIMIT 3")
            .expect("parse");
        assert_eq!(q.service.as_deref(), Some("sales"));
        assert_eq!(q.select.len(), 2);
        assert_eq!(q.select[1].output_name(), "label");
        assert_eq!(
            q.where_condition.as_ref().map(|c| c.to_string()).as_deref(),
            Some("(region = 'EU') AND (amount > 10)")
        );
        assert_eq!(q.order_by.len(), 1);
        assert!(!q.order_by[0].ascending);
        assert_eq!(q.order_by[0].field.index, 2);
        assert_eq!(q.limit, Some(3));
    }

    #[test]
    fn parses_aggregates() {
        let q = sql_to_query(
            "SELECT k, COUNT(*), COUNT(DISTINCT v) AS d, SUM(1) FROM s GROUP BY k HAVING COUNT(*) > 1",
        )
        .expect("parse");
        assert!(q.has_aggregates());
        assert_eq!(q.group_by, vec!["k"]);
        assert!(q.select[1].aggregate().expect("count").is_count_star());
        let d = q.select[2].aggregate().expect("distinct");
        assert!(d.distinct);
        assert_eq!(d.subject, AggregateSubject::Field("v".into()));
        assert_eq!(
            q.select[3].aggregate().expect("sum").subject,
            AggregateSubject::Constant(LiteralValue::Int64(1))
        );
        let having = q.having.expect("having");
        assert_eq!(having.aggregates(), vec![&AggregateExpr::count_star()]);
    }

    #[test]
    fn parses_iif() {
        let q = sql_to_query("SELECT IIF(a > 1 OR b IS NULL, a, -1) AS c FROM s").expect("parse");
        let iif = q.select[0].iif().expect("iif");
        assert_eq!(iif.condition.to_string(), "(a > 1) OR (b IS NULL)");
        assert_eq!(iif.when_true, IifValue::Field("a".into()));
        assert_eq!(iif.when_false, IifValue::Literal(LiteralValue::Int64(-1)));
    }

    #[test]
    fn placeholders_become_parameters() {
        let q = sql_to_query("SELECT a FROM s WHERE region = :region").expect("parse");
        let Some(Condition::Atom { right, .. }) = q.where_condition else {
            panic!("atom expected");
        };
        assert_eq!(right, Operand::Parameter("region".into()));
    }

    #[test]
    fn select_without_from() {
        let q = sql_to_query("SELECT 1, 'x' AS s").expect("parse");
        assert!(q.service.is_none());
        assert_eq!(q.select[1].column_name(), "s");
    }

    #[test]
    fn negated_like_and_in_list() {
        let q = sql_to_query("SELECT a FROM s WHERE b NOT LIKE 'x%' AND a IN (1, 2)").expect("parse");
        assert_eq!(
            q.where_condition.expect("where").to_string(),
            "(NOT (b LIKE 'x%')) AND (a IN (1, 2))"
        );
    }

    #[test]
    fn rejects_unsupported_shapes() {
        for sql in [
            "SELECT * FROM s",
            "SELECT a FROM s JOIN t ON s.a = t.a",
            "SELECT UPPER(a) FROM s",
            "SELECT a FROM s UNION SELECT a FROM t",
            "SELECT a FROM s; SELECT b FROM s",
            "SELECT IIF(a > 1, a) FROM s",
        ] {
            assert!(
                matches!(sql_to_query(sql), Err(SvqError::Unsupported(_))),
                "{sql}"
            );
        }
    }
}
