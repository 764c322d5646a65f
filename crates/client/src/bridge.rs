use async_trait::async_trait;
use svq_common::{global_metrics, Result};
use svq_execution::{Row, RowListener, RowProducer};
use svq_planner::RowSchema;
use tracing::debug;

/// Forwards every row written by a service's output node into the injector
/// of a generated pipeline, then signals end of rows once.
pub struct RowBridge {
    service: String,
    producer: RowProducer,
    rows: u64,
}

impl RowBridge {
    pub fn new(service: impl Into<String>, producer: RowProducer) -> Self {
        Self {
            service: service.into(),
            producer,
            rows: 0,
        }
    }
}

#[async_trait]
impl RowListener for RowBridge {
    async fn row_written(&mut self, _schema: &RowSchema, row: &Row) -> Result<()> {
        self.producer.put_row(row.clone()).await?;
        self.rows += 1;
        Ok(())
    }

    async fn finished(&mut self) -> Result<()> {
        self.producer.finish().await?;
        global_metrics().record_bridge_rows(&self.service, self.rows);
        debug!(service = %self.service, rows = self.rows, "bridge delivered end of rows");
        Ok(())
    }
}
