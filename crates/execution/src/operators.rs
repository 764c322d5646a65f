//! Per-node operator loops. Each node of a running pipeline executes
//! [`run_node`] on its own task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow_schema::DataType;
use svq_common::{global_metrics, Result, SvqError};
use svq_planner::{
    AggregateKind, BranchTarget, GroupByConfig, OperatorKind, OperatorNode, RowSchema, SortKey,
};
use tracing::debug;

use crate::eval::evaluate;
use crate::listener::RowListener;
use crate::stream::{BridgeMessage, RowInputs, RowSender, StopSignal};
use crate::value::{Row, ScalarValue};

/// Everything a node writes to: downstream edges and attached listeners.
pub(crate) struct NodeOutputs {
    pub(crate) pipeline: Arc<str>,
    pub(crate) schema: RowSchema,
    pub(crate) main: Vec<RowSender>,
    pub(crate) on_true: Option<RowSender>,
    pub(crate) on_false: Option<RowSender>,
    pub(crate) listeners: Vec<Box<dyn RowListener>>,
    pub(crate) rows_out: u64,
}

impl NodeOutputs {
    async fn notify(&mut self, row: &Row) -> Result<()> {
        self.rows_out += 1;
        for l in &mut self.listeners {
            l.row_written(&self.schema, row).await?;
        }
        Ok(())
    }

    async fn emit(&mut self, row: Row, stop: &StopSignal) -> Result<()> {
        self.notify(&row).await?;
        if let Some((last, rest)) = self.main.split_last_mut() {
            for tx in rest {
                tx.send(BridgeMessage::Row(row.clone()), stop).await?;
            }
            last.send(BridgeMessage::Row(row), stop).await?;
        }
        Ok(())
    }

    /// Route to a filter branch; a branch without target drops the row.
    async fn emit_branch(&mut self, branch: BranchTarget, row: Row, stop: &StopSignal) -> Result<()> {
        let target = match branch {
            BranchTarget::True => self.on_true.as_mut(),
            BranchTarget::False => self.on_false.as_mut(),
        };
        let Some(tx) = target else { return Ok(()) };
        self.rows_out += 1;
        for l in &mut self.listeners {
            l.row_written(&self.schema, &row).await?;
        }
        tx.send(BridgeMessage::Row(row), stop).await
    }

    async fn finish(&mut self, stop: &StopSignal) -> Result<()> {
        let senders = self
            .main
            .iter_mut()
            .chain(self.on_true.as_mut())
            .chain(self.on_false.as_mut());
        for tx in senders {
            tx.send(BridgeMessage::EndOfRows, stop).await?;
        }
        for l in &mut self.listeners {
            l.finished().await?;
        }
        Ok(())
    }
}

/// Run one operator until its inputs are exhausted; returns rows written.
pub(crate) async fn run_node(
    node: OperatorNode,
    input_schema: RowSchema,
    mut inputs: RowInputs,
    mut out: NodeOutputs,
    stop: StopSignal,
) -> Result<u64> {
    debug!(pipeline = %out.pipeline, operator = %node.name, kind = node.kind.type_name(), "operator started");
    let stop = &stop;
    match &node.kind {
        OperatorKind::Injector => {
            while let Some(row) = inputs.next(stop).await? {
                if row.len() != node.schema.len() {
                    return Err(SvqError::Execution(format!(
                        "injector '{}' expects {} values per row, got {}",
                        node.name,
                        node.schema.len(),
                        row.len()
                    )));
                }
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::Dummy => {
            while let Some(row) = inputs.next(stop).await? {
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::SingleEmptyRow => out.emit(vec![], stop).await?,
        OperatorKind::RowSource(rows) => {
            for literals in rows {
                let row = literals
                    .iter()
                    .zip(node.schema.columns())
                    .map(|(v, c)| ScalarValue::from(v).cast_to(&c.data_type))
                    .collect::<Result<Row>>()?;
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::ConstantRow(fields) => {
            let values = fields
                .iter()
                .map(|c| ScalarValue::from(&c.value).cast_to(&c.data_type))
                .collect::<Result<Vec<_>>>()?;
            while let Some(mut row) = inputs.next(stop).await? {
                row.extend(values.iter().cloned());
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::CopyField(cfg) => {
            while let Some(mut row) = inputs.next(stop).await? {
                let v = column(&row, cfg.source)?.cast_to(&cfg.data_type)?;
                row.push(v);
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::Filter(cfg) => {
            let branching = cfg.is_branching();
            while let Some(row) = inputs.next(stop).await? {
                let pass = evaluate(&cfg.condition, &row)?;
                if branching {
                    let branch = if pass {
                        BranchTarget::True
                    } else {
                        BranchTarget::False
                    };
                    out.emit_branch(branch, row, stop).await?;
                } else if pass {
                    out.emit(row, stop).await?;
                }
            }
        }
        OperatorKind::GroupBy(cfg) => {
            let mut table = GroupTable::new(cfg, &input_schema);
            while let Some(row) = inputs.next(stop).await? {
                table.update(&row)?;
            }
            for row in table.finish() {
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::Sort(keys) => {
            let mut rows = vec![];
            while let Some(row) = inputs.next(stop).await? {
                for k in keys {
                    column(&row, k.column)?;
                }
                rows.push(row);
            }
            rows.sort_by(|a, b| compare_rows(keys, a, b));
            for row in rows {
                out.emit(row, stop).await?;
            }
        }
        OperatorKind::Project(fields) => {
            while let Some(row) = inputs.next(stop).await? {
                let projected = fields
                    .iter()
                    .map(|f| column(&row, f.source).cloned())
                    .collect::<Result<Row>>()?;
                out.emit(projected, stop).await?;
            }
        }
        OperatorKind::Sample(cfg) => {
            let mut seen = 0usize;
            // rows past the window are still consumed so upstream never blocks
            while let Some(row) = inputs.next(stop).await? {
                seen += 1;
                if seen >= cfg.first_row && seen <= cfg.last_row {
                    out.emit(row, stop).await?;
                }
            }
        }
    }
    out.finish(stop).await?;
    global_metrics().record_operator_rows(&out.pipeline, &node.name, out.rows_out);
    debug!(pipeline = %out.pipeline, operator = %node.name, rows = out.rows_out, "operator finished");
    Ok(out.rows_out)
}

fn column(row: &[ScalarValue], index: usize) -> Result<&ScalarValue> {
    row.get(index).ok_or_else(|| {
        SvqError::Execution(format!(
            "column ${index} out of range for a row of {} values",
            row.len()
        ))
    })
}

fn compare_rows(keys: &[SortKey], a: &Row, b: &Row) -> std::cmp::Ordering {
    for k in keys {
        let ord = a[k.column].cmp(&b[k.column]);
        let ord = if k.ascending { ord } else { ord.reverse() };
        if ord.is_ne() {
            return ord;
        }
    }
    std::cmp::Ordering::Equal
}

/// Hash aggregation state; groups are emitted in first-seen order.
struct GroupTable<'a> {
    cfg: &'a GroupByConfig,
    subject_types: Vec<DataType>,
    index: HashMap<Row, usize>,
    groups: Vec<(Row, Vec<Accumulator>)>,
}

impl<'a> GroupTable<'a> {
    fn new(cfg: &'a GroupByConfig, input: &RowSchema) -> Self {
        let subject_types = cfg
            .aggregates
            .iter()
            .map(|a| {
                input
                    .column(a.subject)
                    .map(|c| c.data_type.clone())
                    .unwrap_or(DataType::Null)
            })
            .collect();
        Self {
            cfg,
            subject_types,
            index: HashMap::new(),
            groups: vec![],
        }
    }

    fn accumulators(&self) -> Vec<Accumulator> {
        self.cfg
            .aggregates
            .iter()
            .zip(&self.subject_types)
            .map(|(a, t)| Accumulator::new(a.kind, t))
            .collect()
    }

    fn update(&mut self, row: &Row) -> Result<()> {
        let key = self
            .cfg
            .keys
            .iter()
            .map(|k| column(row, *k).cloned())
            .collect::<Result<Row>>()?;
        let slot = match self.index.get(&key) {
            Some(i) => *i,
            None => {
                let accs = self.accumulators();
                self.groups.push((key.clone(), accs));
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        let accs = &mut self.groups[slot].1;
        for (acc, spec) in accs.iter_mut().zip(&self.cfg.aggregates) {
            acc.update(column(row, spec.subject)?)?;
        }
        Ok(())
    }

    fn finish(self) -> Vec<Row> {
        if self.groups.is_empty() && self.cfg.always_emit_one_row {
            let mut row = vec![ScalarValue::Null; self.cfg.keys.len()];
            row.extend(self.accumulators().into_iter().map(Accumulator::finish));
            return vec![row];
        }
        self.groups
            .into_iter()
            .map(|(mut key, accs)| {
                key.extend(accs.into_iter().map(Accumulator::finish));
                key
            })
            .collect()
    }
}

enum Accumulator {
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: u64 },
    CountAll(i64),
    CountAny(i64),
    CountDistinct(HashSet<ScalarValue>),
}

impl Accumulator {
    fn new(kind: AggregateKind, subject: &DataType) -> Self {
        match kind {
            AggregateKind::Sum if kind.output_type(subject) == DataType::Int64 => {
                Accumulator::SumInt(None)
            }
            AggregateKind::Sum => Accumulator::SumFloat(None),
            AggregateKind::Min => Accumulator::Min(None),
            AggregateKind::Max => Accumulator::Max(None),
            AggregateKind::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateKind::CountAll => Accumulator::CountAll(0),
            AggregateKind::CountAny => Accumulator::CountAny(0),
            AggregateKind::CountDistinct => Accumulator::CountDistinct(HashSet::new()),
        }
    }

    fn update(&mut self, v: &ScalarValue) -> Result<()> {
        if let Accumulator::CountAny(n) = self {
            *n += 1;
            return Ok(());
        }
        if v.is_null() {
            return Ok(());
        }
        match self {
            Accumulator::SumInt(acc) => {
                let ScalarValue::Int64(x) = v.cast_to(&DataType::Int64)? else {
                    return Ok(());
                };
                let sum = acc.unwrap_or(0).checked_add(x).ok_or_else(|| {
                    SvqError::Execution("integer overflow in SUM".to_string())
                })?;
                *acc = Some(sum);
            }
            Accumulator::SumFloat(acc) => *acc = Some(acc.unwrap_or(0.0) + numeric(v)?),
            Accumulator::Min(acc) => {
                if acc.as_ref().map_or(true, |m| v < m) {
                    *acc = Some(v.clone());
                }
            }
            Accumulator::Max(acc) => {
                if acc.as_ref().map_or(true, |m| v > m) {
                    *acc = Some(v.clone());
                }
            }
            Accumulator::Avg { sum, count } => {
                *sum += numeric(v)?;
                *count += 1;
            }
            Accumulator::CountAll(n) => *n += 1,
            Accumulator::CountDistinct(seen) => {
                seen.insert(v.clone());
            }
            Accumulator::CountAny(_) => {}
        }
        Ok(())
    }

    fn finish(self) -> ScalarValue {
        match self {
            Accumulator::SumInt(v) => v.map_or(ScalarValue::Null, ScalarValue::Int64),
            Accumulator::SumFloat(v) => v.map_or(ScalarValue::Null, ScalarValue::Float64),
            Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(ScalarValue::Null),
            Accumulator::Avg { count: 0, .. } => ScalarValue::Null,
            Accumulator::Avg { sum, count } => ScalarValue::Float64(sum / count as f64),
            Accumulator::CountAll(n) | Accumulator::CountAny(n) => ScalarValue::Int64(n),
            Accumulator::CountDistinct(seen) => ScalarValue::Int64(seen.len() as i64),
        }
    }
}

fn numeric(v: &ScalarValue) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| SvqError::Execution(format!("value '{v}' is not numeric")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use svq_planner::AggregateSpec;

    fn spec(kind: AggregateKind) -> AggregateSpec {
        AggregateSpec {
            output: "out".to_string(),
            subject: 1,
            kind,
        }
    }

    fn input() -> RowSchema {
        RowSchema::new(vec![
            svq_planner::ColumnDef::new("k", DataType::Utf8),
            svq_planner::ColumnDef::new("v", DataType::Int64),
        ])
        .expect("schema")
    }

    fn row(k: &str, v: Option<i64>) -> Row {
        vec![
            ScalarValue::from(k),
            v.map_or(ScalarValue::Null, ScalarValue::Int64),
        ]
    }

    #[test]
    fn groups_in_first_seen_order() {
        let cfg = GroupByConfig {
            keys: vec![0],
            aggregates: vec![
                spec(AggregateKind::Sum),
                spec(AggregateKind::CountAll),
                spec(AggregateKind::CountAny),
                spec(AggregateKind::Max),
            ],
            always_emit_one_row: true,
        };
        let schema = input();
        let mut table = GroupTable::new(&cfg, &schema);
        for r in [row("b", Some(2)), row("a", Some(1)), row("b", None), row("b", Some(5))] {
            table.update(&r).expect("update");
        }
        let out = table.finish();
        assert_eq!(
            out,
            vec![
                vec![
                    ScalarValue::from("b"),
                    ScalarValue::Int64(7),
                    ScalarValue::Int64(2),
                    ScalarValue::Int64(3),
                    ScalarValue::Int64(5),
                ],
                vec![
                    ScalarValue::from("a"),
                    ScalarValue::Int64(1),
                    ScalarValue::Int64(1),
                    ScalarValue::Int64(1),
                    ScalarValue::Int64(1),
                ],
            ]
        );
    }

    #[test]
    fn empty_input_emits_one_row_only_when_asked() {
        let schema = input();
        let counting = GroupByConfig {
            keys: vec![0],
            aggregates: vec![spec(AggregateKind::CountAny), spec(AggregateKind::Avg)],
            always_emit_one_row: true,
        };
        assert_eq!(
            GroupTable::new(&counting, &schema).finish(),
            vec![vec![
                ScalarValue::Null,
                ScalarValue::Int64(0),
                ScalarValue::Null
            ]]
        );
        let summing = GroupByConfig {
            keys: vec![],
            aggregates: vec![spec(AggregateKind::Sum)],
            always_emit_one_row: false,
        };
        assert!(GroupTable::new(&summing, &schema).finish().is_empty());
    }

    #[test]
    fn count_distinct_ignores_nulls() {
        let cfg = GroupByConfig {
            keys: vec![],
            aggregates: vec![spec(AggregateKind::CountDistinct), spec(AggregateKind::Avg)],
            always_emit_one_row: true,
        };
        let schema = input();
        let mut table = GroupTable::new(&cfg, &schema);
        for r in [row("x", Some(1)), row("y", Some(1)), row("z", None), row("w", Some(4))] {
            table.update(&r).expect("update");
        }
        assert_eq!(
            table.finish(),
            vec![vec![ScalarValue::Int64(2), ScalarValue::Float64(2.0)]]
        );
    }

    #[test]
    fn sorts_descending_with_stable_ties() {
        let keys = [SortKey {
            column: 1,
            ascending: false,
        }];
        let mut rows = vec![row("a", Some(1)), row("b", Some(3)), row("c", Some(1)), row("d", None)];
        rows.sort_by(|a, b| compare_rows(&keys, a, b));
        let order: Vec<String> = rows.iter().map(|r| r[0].to_string()).collect();
        assert_eq!(order, vec!["b", "a", "c", "d"]);
    }
}
