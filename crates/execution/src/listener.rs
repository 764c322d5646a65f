//! Row listeners attached to operator nodes, and a collecting listener that
//! turns result rows into an Arrow [`RecordBatch`].

use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, NullArray, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use svq_common::{Result, SvqError};
use svq_planner::RowSchema;

use crate::value::{Row, ScalarValue};

/// Observer of the rows one operator node writes.
///
/// Calls happen on the node's task, in emission order; a slow listener slows
/// the node down. An error fails the node (and with it the pipeline).
#[async_trait]
pub trait RowListener: Send {
    /// One row written by the node; `schema` is the node's output schema.
    async fn row_written(&mut self, schema: &RowSchema, row: &Row) -> Result<()>;

    /// The node wrote its last row. Not called when the node fails or is
    /// stopped.
    async fn finished(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Collected {
    schema: Option<RowSchema>,
    rows: Vec<Row>,
    finished: bool,
}

/// Listener that keeps every row in memory. Clones share one buffer, so a
/// clone handed to a pipeline can be read back through the original.
#[derive(Debug, Clone, Default)]
pub struct RowCollector {
    inner: Arc<Mutex<Collected>>,
}

impl RowCollector {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Collected>> {
        self.inner
            .lock()
            .map_err(|_| SvqError::Execution("row collector lock poisoned".to_string()))
    }

    /// Rows received so far.
    pub fn rows(&self) -> Result<Vec<Row>> {
        Ok(self.lock()?.rows.clone())
    }

    /// Whether the observed node reported its last row.
    pub fn is_finished(&self) -> Result<bool> {
        Ok(self.lock()?.finished)
    }

    /// Collected rows as one batch; `schema` is used when no row arrived.
    pub fn to_record_batch(&self, schema: &RowSchema) -> Result<RecordBatch> {
        let guard = self.lock()?;
        let schema = guard.schema.as_ref().unwrap_or(schema);
        rows_to_record_batch(schema, &guard.rows)
    }
}

#[async_trait]
impl RowListener for RowCollector {
    async fn row_written(&mut self, schema: &RowSchema, row: &Row) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.schema.is_none() {
            guard.schema = Some(schema.clone());
        }
        guard.rows.push(row.clone());
        Ok(())
    }

    async fn finished(&mut self) -> Result<()> {
        self.lock()?.finished = true;
        Ok(())
    }
}

/// Convert rows into a [`RecordBatch`]; integer, float, text and boolean
/// columns widen to `Int64`, `Float64`, `Utf8` and `Boolean`.
pub fn rows_to_record_batch(schema: &RowSchema, rows: &[Row]) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(schema.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.len());
    for (i, col) in schema.columns().iter().enumerate() {
        let values = rows
            .iter()
            .map(|r| {
                r.get(i)
                    .cloned()
                    .unwrap_or(ScalarValue::Null)
                    .cast_to(&col.data_type)
            })
            .collect::<Result<Vec<_>>>()?;
        let (dt, array): (DataType, ArrayRef) = match arrow_type(&col.data_type)? {
            DataType::Int64 => (
                DataType::Int64,
                Arc::new(
                    values
                        .iter()
                        .map(|v| match v {
                            ScalarValue::Int64(x) => Some(*x),
                            _ => None,
                        })
                        .collect::<Int64Array>(),
                ),
            ),
            DataType::Float64 => (
                DataType::Float64,
                Arc::new(
                    values
                        .iter()
                        .map(|v| match v {
                            ScalarValue::Float64(x) => Some(*x),
                            _ => None,
                        })
                        .collect::<Float64Array>(),
                ),
            ),
            DataType::Boolean => (
                DataType::Boolean,
                Arc::new(
                    values
                        .iter()
                        .map(|v| match v {
                            ScalarValue::Boolean(x) => Some(*x),
                            _ => None,
                        })
                        .collect::<BooleanArray>(),
                ),
            ),
            DataType::Utf8 => (
                DataType::Utf8,
                Arc::new(
                    values
                        .iter()
                        .map(|v| match v {
                            ScalarValue::Utf8(x) => Some(x.as_str()),
                            _ => None,
                        })
                        .collect::<StringArray>(),
                ),
            ),
            _ => (DataType::Null, Arc::new(NullArray::new(rows.len()))),
        };
        fields.push(Field::new(&col.name, dt, true));
        columns.push(array);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| SvqError::Execution(format!("cannot build result batch: {e}")))
}

fn arrow_type(dt: &DataType) -> Result<DataType> {
    Ok(match dt {
        DataType::Null => DataType::Null,
        DataType::Boolean => DataType::Boolean,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => DataType::Float64,
        DataType::Utf8 | DataType::LargeUtf8 => DataType::Utf8,
        d if d.is_integer() => DataType::Int64,
        other => {
            return Err(SvqError::Unsupported(format!(
                "result columns of type {other:?} are not supported"
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use svq_planner::ColumnDef;

    #[tokio::test]
    async fn collects_rows_into_a_batch() {
        let schema = RowSchema::new(vec![
            ColumnDef::new("k", DataType::Utf8),
            ColumnDef::new("n", DataType::Int32),
            ColumnDef::new("avg", DataType::Float64),
        ])
        .expect("schema");
        let collector = RowCollector::new();
        let mut listener = collector.clone();
        listener
            .row_written(
                &schema,
                &vec![ScalarValue::from("a"), ScalarValue::Int64(2), ScalarValue::Null],
            )
            .await
            .expect("row");
        listener.finished().await.expect("finished");

        assert!(collector.is_finished().expect("state"));
        let batch = collector.to_record_batch(&schema).expect("batch");
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.schema().field(1).data_type(), &DataType::Int64);
        let n = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int column");
        assert_eq!(n.value(0), 2);
        assert!(batch.column(2).is_null(0));
    }

    #[test]
    fn empty_rows_keep_the_schema() {
        let schema = RowSchema::new(vec![ColumnDef::new("a", DataType::Int64)]).expect("schema");
        let batch = rows_to_record_batch(&schema, &[]).expect("batch");
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.schema().field(0).name(), "a");
    }
}
