use arrow_schema::DataType;
use svq_common::{NodeId, Result, SvqError};
use tracing::debug;

use crate::condition::Condition;
use crate::iif::lower_iif;
use crate::plan::{
    AggregateKind, AggregateSpec, ConstantField, FilterConfig, GroupByConfig, OperatorKind, Plan,
    PlanGraph, ProjectField, SampleConfig, SortKey,
};
use crate::query::{
    AggregateExpr, AggregateFunction, AggregateSubject, IifExpr, IifValue, Query, SelectExpr,
    SelectField,
};
use crate::schema::{ColumnDef, RowSchema};

const LAYOUT_STEP: i32 = 150;
const LAYOUT_ROW: i32 = 100;

/// Compile a parsed [`Query`] into a linear operator [`Plan`].
///
/// Stage order:
/// entry, constants, select IIFs, WHERE, aggregation, order IIFs, HAVING,
/// DISTINCT, ORDER BY, projection, limit, result.
///
/// Contracts:
/// - every stage appends after the current tail and becomes the new tail;
/// - stages with nothing to do add no node;
/// - every field reference is bound against the schema produced by the
///   stage before it, failing with a binding error when absent.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    name: String,
    service_schema: RowSchema,
}

impl PlanBuilder {
    /// `service_schema` is the output schema of the service pipeline the
    /// query reads from; it is ignored for queries without a FROM clause.
    pub fn new(name: impl Into<String>, service_schema: RowSchema) -> Self {
        Self {
            name: name.into(),
            service_schema,
        }
    }

    /// Build the plan. `row_limit` caps the result on top of the query's own
    /// `LIMIT`; 0 means no cap.
    pub fn build(&self, query: &Query, row_limit: usize) -> Result<Plan> {
        let mut graph = PlanGraph::new(&self.name);
        let entry = match &query.service {
            Some(_) => graph.add_node("Injector", OperatorKind::Injector, self.service_schema.clone()),
            None => graph.add_node("Generate row", OperatorKind::SingleEmptyRow, RowSchema::empty()),
        };
        graph.place(entry, 0, LAYOUT_ROW);

        let mut stages = Stages {
            query,
            graph,
            tail: entry,
            step: 1,
            aggregate_columns: vec![],
        };
        stages.constants()?;
        stages.select_iifs()?;
        stages.where_filter()?;
        stages.aggregation()?;
        stages.order_iifs()?;
        stages.having()?;
        stages.distinct()?;
        stages.order_by()?;
        stages.projection()?;
        stages.limit(row_limit)?;

        let schema = stages.graph.schema(stages.tail)?.clone();
        let result = stages.append("Result", OperatorKind::Dummy, schema);
        let plan = stages.graph.finish(entry, result)?;
        debug!(
            plan = %plan.name(),
            nodes = plan.nodes().len(),
            shape = ?plan.main_path(),
            "built query plan"
        );
        Ok(plan)
    }
}

struct Stages<'q> {
    query: &'q Query,
    graph: PlanGraph,
    tail: NodeId,
    step: i32,
    /// Aggregate expression -> column holding its value after aggregation.
    aggregate_columns: Vec<(AggregateExpr, String)>,
}

impl Stages<'_> {
    fn append(&mut self, name: &str, kind: OperatorKind, schema: RowSchema) -> NodeId {
        let id = self.graph.add_node(name, kind, schema);
        self.graph.connect(self.tail, id);
        self.graph.place(id, self.step * LAYOUT_STEP, LAYOUT_ROW);
        self.step += 1;
        self.tail = id;
        id
    }

    fn tail_schema(&self) -> Result<RowSchema> {
        Ok(self.graph.schema(self.tail)?.clone())
    }

    fn constants(&mut self) -> Result<()> {
        let mut fields = vec![];
        for f in &self.query.select {
            match &f.expr {
                SelectExpr::Constant(v) => fields.push(ConstantField {
                    name: f.column_name(),
                    value: v.clone(),
                    data_type: v.data_type(),
                }),
                SelectExpr::Aggregate(AggregateExpr {
                    subject: AggregateSubject::Constant(v),
                    ..
                }) => fields.push(ConstantField {
                    name: constant_subject_column(f),
                    value: v.clone(),
                    data_type: v.data_type(),
                }),
                _ => {}
            }
        }
        if fields.is_empty() {
            return Ok(());
        }
        let mut schema = self.tail_schema()?;
        for c in &fields {
            schema.push(ColumnDef::new(&c.name, c.data_type.clone()))?;
        }
        self.append("Constants", OperatorKind::ConstantRow(fields), schema);
        Ok(())
    }

    fn select_iifs(&mut self) -> Result<()> {
        let query = self.query;
        for f in query.select.iter().filter(|f| f.iif().is_some()) {
            self.iif(f)?;
        }
        Ok(())
    }

    fn order_iifs(&mut self) -> Result<()> {
        let query = self.query;
        for o in query.order_by.iter().filter(|o| o.field.iif().is_some()) {
            self.iif(&o.field)?;
        }
        Ok(())
    }

    fn iif(&mut self, field: &SelectField) -> Result<()> {
        let first = self.graph.len();
        let merge = lower_iif(field, &mut self.graph, self.tail)?;
        // filter, true branch, false branch, merge
        let x = self.step * LAYOUT_STEP;
        for (offset, id) in (first..self.graph.len()).map(NodeId).enumerate() {
            let (dx, y) = match offset {
                0 => (0, LAYOUT_ROW),
                1 => (LAYOUT_STEP, 0),
                2 => (LAYOUT_STEP, 2 * LAYOUT_ROW),
                _ => (2 * LAYOUT_STEP, LAYOUT_ROW),
            };
            self.graph.place(id, x + dx, y);
        }
        self.step += 3;
        self.tail = merge;
        Ok(())
    }

    fn where_filter(&mut self) -> Result<()> {
        let query = self.query;
        let Some(condition) = &query.where_condition else {
            return Ok(());
        };
        let schema = self.tail_schema()?;
        let bound = condition.bind_plain(&schema)?;
        self.append("Where", OperatorKind::Filter(FilterConfig::new(bound)), schema);
        Ok(())
    }

    fn aggregation(&mut self) -> Result<()> {
        let query = self.query;
        let hidden = query
            .having
            .as_ref()
            .map(Condition::aggregates)
            .unwrap_or_default();
        if !query.has_aggregates() && query.group_by.is_empty() && hidden.is_empty() {
            return Ok(());
        }
        let input = self.tail_schema()?;
        let mut keys = vec![];
        let mut output = RowSchema::empty();
        for name in &query.group_by {
            let key = resolve_group_key(query, &input, name)?;
            if !keys.contains(&key) {
                keys.push(key);
                output.push(input.columns()[key].clone())?;
            }
        }

        // Non-aggregate select fields have to survive the group-by.
        let constant_columns: Vec<String> = query
            .select
            .iter()
            .filter(|f| matches!(f.expr, SelectExpr::Constant(_)))
            .map(SelectField::column_name)
            .collect();
        let mut regrouped_constants = vec![];
        for f in &query.select {
            let column = match &f.expr {
                SelectExpr::Aggregate(_) => continue,
                _ => input.resolve(&f.column_name())?,
            };
            if keys.contains(&column) {
                continue;
            }
            match &f.expr {
                SelectExpr::Constant(v) => regrouped_constants.push(ConstantField {
                    name: f.column_name(),
                    value: v.clone(),
                    data_type: v.data_type(),
                }),
                SelectExpr::Iif(iif) if fixed_per_group(iif, &input, &keys, &constant_columns) => {
                    keys.push(column);
                    output.push(input.columns()[column].clone())?;
                }
                _ => {
                    return Err(SvqError::PlanConstruction(format!(
                        "select field '{}' is neither aggregated nor grouped",
                        f.output_name()
                    )))
                }
            }
        }

        let mut aggregates = vec![];
        for f in &query.select {
            let Some(a) = f.aggregate() else { continue };
            let constant = matches!(a.subject, AggregateSubject::Constant(_))
                .then(|| constant_subject_column(f));
            let spec = aggregate_spec(a, f.column_name(), constant, &input)?;
            self.aggregate_columns.push((a.clone(), spec.output.clone()));
            aggregates.push(spec);
        }
        // HAVING may reference aggregates that are not selected.
        for a in hidden {
            if self.aggregate_columns.iter().any(|(known, _)| known == a) {
                continue;
            }
            let spec = aggregate_spec(a, a.display_name(), None, &input)?;
            self.aggregate_columns.push((a.clone(), spec.output.clone()));
            aggregates.push(spec);
        }
        for spec in &aggregates {
            let subject_type = &input.columns()[spec.subject].data_type;
            output.push(ColumnDef::new(&spec.output, spec.kind.output_type(subject_type)))?;
        }

        let always_emit_one_row = aggregates.iter().any(|s| s.kind.is_count());
        self.append(
            "Group by",
            OperatorKind::GroupBy(GroupByConfig {
                keys,
                aggregates,
                always_emit_one_row,
            }),
            output.clone(),
        );
        // Constants are re-added after grouping so an empty input still
        // yields their values next to a zero count.
        if !regrouped_constants.is_empty() {
            for c in &regrouped_constants {
                output.push(ColumnDef::new(&c.name, c.data_type.clone()))?;
            }
            self.append(
                "Grouped constants",
                OperatorKind::ConstantRow(regrouped_constants),
                output,
            );
        }
        Ok(())
    }

    fn having(&mut self) -> Result<()> {
        let query = self.query;
        let Some(condition) = &query.having else {
            return Ok(());
        };
        let schema = self.tail_schema()?;
        // GROUP BY aliases are not columns after grouping.
        let condition = condition.map_fields(&|name: &str| {
            if schema.contains(name) {
                return name.to_string();
            }
            match query.select.iter().find(|f| f.alias.as_deref() == Some(name)) {
                Some(f) if schema.contains(&f.column_name()) => f.column_name(),
                _ => name.to_string(),
            }
        });
        let columns = &self.aggregate_columns;
        let bound = condition.bind(&schema, &|a: &AggregateExpr| {
            columns
                .iter()
                .find(|(known, _)| known == a)
                .map(|(_, column)| column.clone())
        })?;
        self.append("Having", OperatorKind::Filter(FilterConfig::new(bound)), schema);
        Ok(())
    }

    fn distinct(&mut self) -> Result<()> {
        let query = self.query;
        if !query.distinct {
            return Ok(());
        }
        let input = self.tail_schema()?;
        let mut keys = vec![];
        let mut output = RowSchema::empty();
        for f in &query.select {
            let name = match &f.alias {
                Some(alias) if input.contains(alias) => alias.clone(),
                _ => f.column_name(),
            };
            let key = input.resolve(&name)?;
            if !keys.contains(&key) {
                keys.push(key);
                output.push(input.columns()[key].clone())?;
            }
        }
        self.append(
            "Distinct",
            OperatorKind::GroupBy(GroupByConfig {
                keys,
                aggregates: vec![],
                always_emit_one_row: false,
            }),
            output,
        );
        Ok(())
    }

    fn order_by(&mut self) -> Result<()> {
        let query = self.query;
        if query.order_by.is_empty() {
            return Ok(());
        }
        let schema = self.tail_schema()?;
        let mut keys = vec![];
        for o in &query.order_by {
            let name = o.field.column_name();
            let column = match schema.index_of(&name) {
                Some(i) => i,
                None => {
                    let target = query.find_select_field(&name).ok_or_else(|| {
                        SvqError::Binding(format!(
                            "ORDER BY field '{name}' is neither a column nor a select alias"
                        ))
                    })?;
                    schema.resolve(&target.column_name())?
                }
            };
            keys.push(SortKey {
                column,
                ascending: o.ascending,
            });
        }
        self.append("Order by", OperatorKind::Sort(keys), schema);
        Ok(())
    }

    fn projection(&mut self) -> Result<()> {
        let query = self.query;
        if query.has_aggregates() || query.select.iter().all(SelectField::is_aggregate) {
            return Ok(());
        }
        let input = self.tail_schema()?;
        let mut fields = vec![];
        let mut output = RowSchema::empty();
        for f in &query.select {
            let source = input.resolve(&f.column_name())?;
            let out = f.output_name();
            output.push(input.columns()[source].renamed(&out))?;
            fields.push(ProjectField {
                source,
                output: out,
            });
        }
        self.append("Select", OperatorKind::Project(fields), output);
        Ok(())
    }

    /// The smaller of the query's `LIMIT` and the caller's cap; `LIMIT 0`
    /// keeps a sample node that lets no row through.
    fn limit(&mut self, row_limit: usize) -> Result<()> {
        let cap = (row_limit > 0).then_some(row_limit);
        let last_row = match (self.query.limit, cap) {
            (Some(a), Some(b)) => a.min(b),
            (Some(n), None) | (None, Some(n)) => n,
            (None, None) => return Ok(()),
        };
        let schema = self.tail_schema()?;
        self.append(
            "Limit",
            OperatorKind::Sample(SampleConfig {
                first_row: 1,
                last_row,
            }),
            schema,
        );
        Ok(())
    }
}

/// Column materializing the literal argument of `COUNT(1)`-style aggregates.
fn constant_subject_column(field: &SelectField) -> String {
    format!("constant_{}", field.index)
}

/// An IIF whose fields are all group keys or constants has one value per
/// group, so it can be carried through the group-by as an extra key.
fn fixed_per_group(iif: &IifExpr, input: &RowSchema, keys: &[usize], constants: &[String]) -> bool {
    let mut names = iif.condition.field_names();
    for value in [&iif.when_true, &iif.when_false] {
        if let IifValue::Field(name) = value {
            names.push(name.as_str());
        }
    }
    names.into_iter().all(|name| {
        constants.iter().any(|c| c == name)
            || input.index_of(name).is_some_and(|i| keys.contains(&i))
    })
}

/// GROUP BY names a column directly or a select alias of one.
fn resolve_group_key(query: &Query, input: &RowSchema, name: &str) -> Result<usize> {
    if let Some(i) = input.index_of(name) {
        return Ok(i);
    }
    match query.select.iter().find(|f| f.alias.as_deref() == Some(name)) {
        Some(SelectField {
            expr: SelectExpr::Field(column),
            ..
        }) => input.resolve(column),
        _ => input.resolve(name),
    }
}

fn aggregate_spec(
    a: &AggregateExpr,
    output: String,
    constant_column: Option<String>,
    input: &RowSchema,
) -> Result<AggregateSpec> {
    let subject = match (&a.subject, constant_column) {
        (AggregateSubject::Field(name), _) => input.resolve(name)?,
        (AggregateSubject::Constant(_), Some(column)) => input.resolve(&column)?,
        (AggregateSubject::Constant(_), None) if a.function != AggregateFunction::Count => {
            return Err(SvqError::Unsupported(format!(
                "{} over a literal is only supported in the select list",
                a.display_name()
            )))
        }
        (AggregateSubject::Star | AggregateSubject::Constant(_), _) => {
            if input.is_empty() {
                return Err(SvqError::PlanConstruction(format!(
                    "{} needs a subject field but the input has no fields",
                    a.display_name()
                )));
            }
            0
        }
    };
    let kind = match a.function {
        AggregateFunction::Sum => AggregateKind::Sum,
        AggregateFunction::Min => AggregateKind::Min,
        AggregateFunction::Max => AggregateKind::Max,
        AggregateFunction::Avg => AggregateKind::Avg,
        AggregateFunction::Count if a.distinct => AggregateKind::CountDistinct,
        AggregateFunction::Count if a.subject == AggregateSubject::Star => AggregateKind::CountAny,
        AggregateFunction::Count => AggregateKind::CountAll,
    };
    if kind == AggregateKind::Sum || kind == AggregateKind::Avg {
        let t = &input.columns()[subject].data_type;
        if !t.is_numeric() && *t != DataType::Null {
            return Err(SvqError::PlanConstruction(format!(
                "{} needs a numeric subject, got {t:?}",
                a.display_name()
            )));
        }
    }
    Ok(AggregateSpec {
        output,
        subject,
        kind,
    })
}
