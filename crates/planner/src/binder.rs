use std::collections::HashSet;

use svq_common::{Result, SvqError};

use crate::condition::Condition;
use crate::query::{AggregateSubject, IifValue, Query, SelectExpr};
use crate::schema::RowSchema;

/// Check every field reference of `query` against the service schema before
/// anything is built or started.
///
/// Names visible to the select list, IIF expressions and WHERE are the service
/// columns plus the columns synthesized ahead of them (constants, then IIF
/// targets in select order). GROUP BY may also name a select alias. ORDER BY
/// and HAVING are resolved by the plan builder, where the post-aggregation
/// schema is known.
pub fn bind_query(query: &Query, service_schema: &RowSchema) -> Result<()> {
    let mut visible: HashSet<String> = service_schema
        .names()
        .into_iter()
        .map(str::to_string)
        .collect();
    for f in &query.select {
        if matches!(f.expr, SelectExpr::Constant(_)) {
            visible.insert(f.column_name());
        }
    }

    for f in &query.select {
        match &f.expr {
            SelectExpr::Field(name) => require(&visible, name, service_schema)?,
            SelectExpr::Aggregate(a) => {
                if let AggregateSubject::Field(name) = &a.subject {
                    require(&visible, name, service_schema)?;
                }
            }
            SelectExpr::Iif(iif) => {
                require_condition(&visible, &iif.condition, service_schema)?;
                for value in [&iif.when_true, &iif.when_false] {
                    if let IifValue::Field(name) = value {
                        require(&visible, name, service_schema)?;
                    }
                }
                visible.insert(f.column_name());
            }
            SelectExpr::Constant(_) => {}
        }
    }

    if let Some(condition) = &query.where_condition {
        if !condition.aggregates().is_empty() {
            return Err(SvqError::Binding(
                "aggregates are not allowed in WHERE".to_string(),
            ));
        }
        require_condition(&visible, condition, service_schema)?;
    }

    for name in &query.group_by {
        let aliased = query
            .select
            .iter()
            .any(|f| f.alias.as_deref() == Some(name.as_str()));
        if !aliased {
            require(&visible, name, service_schema)?;
        }
    }
    Ok(())
}

fn require_condition(
    visible: &HashSet<String>,
    condition: &Condition,
    service_schema: &RowSchema,
) -> Result<()> {
    for name in condition.field_names() {
        require(visible, name, service_schema)?;
    }
    Ok(())
}

fn require(visible: &HashSet<String>, name: &str, service_schema: &RowSchema) -> Result<()> {
    if visible.contains(name) {
        return Ok(());
    }
    // Reuse the schema's message, which lists the available fields.
    service_schema.resolve(name).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;
    use crate::sql_frontend::sql_to_query;
    use arrow_schema::DataType;

    fn schema() -> RowSchema {
        RowSchema::new(vec![
            ColumnDef::new("a", DataType::Int64),
            ColumnDef::new("b", DataType::Utf8),
        ])
        .expect("schema")
    }

    fn bind(sql: &str) -> Result<()> {
        bind_query(&sql_to_query(sql)?, &schema())
    }

    #[test]
    fn accepts_known_fields_and_aliases() {
        bind("SELECT a, b AS k, COUNT(*) FROM s WHERE a > 1 GROUP BY k").expect("bind");
        bind("SELECT 1 AS one, IIF(a > one, a, one) AS c FROM s WHERE c = 1").expect("bind");
    }

    #[test]
    fn rejects_unknown_references() {
        for sql in [
            "SELECT zz FROM s",
            "SELECT SUM(zz) FROM s",
            "SELECT a FROM s WHERE zz = 1",
            "SELECT IIF(zz > 1, a, b) FROM s",
            "SELECT IIF(a > 1, zz, b) FROM s",
            "SELECT a FROM s GROUP BY zz",
        ] {
            let err = bind(sql).expect_err(sql);
            assert!(matches!(err, SvqError::Binding(_)), "{sql}: {err}");
        }
    }

    #[test]
    fn rejects_aggregates_in_where() {
        assert!(matches!(
            bind("SELECT a FROM s WHERE COUNT(*) > 1"),
            Err(SvqError::Binding(_))
        ));
    }

    #[test]
    fn error_lists_available_fields() {
        let err = bind("SELECT nope FROM s").expect_err("unknown");
        assert!(err.to_string().contains("a, b"), "{err}");
    }
}
