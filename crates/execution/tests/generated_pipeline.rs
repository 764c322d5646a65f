use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_schema::DataType;
use svq_common::{EngineConfig, NodeId};
use svq_execution::{PipelineStatus, RowCollector, RunningPipeline, ScalarValue};
use svq_planner::{sql_to_query, ColumnDef, PlanBuilder, RowSchema};

fn service_schema() -> RowSchema {
    RowSchema::new(vec![
        ColumnDef::new("id", DataType::Int64),
        ColumnDef::new("score", DataType::Float64),
    ])
    .expect("schema")
}

async fn run(sql: &str, rows: Vec<Vec<ScalarValue>>, observe: &[&str]) -> Vec<RowCollector> {
    let query = sql_to_query(sql).expect("parse");
    let plan = PlanBuilder::new("sql-test", service_schema())
        .build(&query, 0)
        .expect("plan");
    let exit = plan.exit_node().name.clone();
    let mut pipeline = RunningPipeline::instantiate(Arc::new(plan), &BTreeMap::new(), &EngineConfig::default())
        .expect("instantiate");
    let mut collectors = vec![];
    for name in observe.iter().copied().chain([exit.as_str()]) {
        let c = RowCollector::new();
        pipeline
            .add_row_listener(name, Box::new(c.clone()))
            .expect("listener");
        collectors.push(c);
    }
    let mut producer = pipeline.row_producer(NodeId(0)).expect("producer");
    pipeline.start().expect("start");
    for row in rows {
        producer.put_row(row).await.expect("put");
    }
    producer.finish().await.expect("finish");
    assert_eq!(
        pipeline.wait_until_finished().await.expect("wait"),
        PipelineStatus::Finished
    );
    collectors
}

fn scored(n: i64) -> Vec<Vec<ScalarValue>> {
    (1..=n)
        .map(|i| vec![ScalarValue::Int64(i), ScalarValue::Float64(i as f64 * 1.5)])
        .collect()
}

#[tokio::test]
async fn iif_merge_emits_one_row_per_filtered_row() {
    let collectors = run(
        "SELECT id, IIF(score >= 6, 'high', 'low') AS band FROM s",
        scored(40),
        &["IIF band filter", "IIF band merge"],
    )
    .await;
    let filtered = collectors[0].rows().expect("rows").len();
    let merged = collectors[1].rows().expect("rows");
    assert_eq!(filtered, 40);
    assert_eq!(merged.len(), filtered);
    let high = merged
        .iter()
        .filter(|r| r.last() == Some(&ScalarValue::from("high")))
        .count();
    assert_eq!(high, 37);
}

#[tokio::test]
async fn sort_and_count_distinct_over_injected_rows() {
    let collectors = run(
        "SELECT id FROM s WHERE score > 3 ORDER BY id DESC",
        scored(4),
        &[],
    )
    .await;
    assert_eq!(
        collectors[0].rows().expect("rows"),
        vec![
            vec![ScalarValue::Int64(4)],
            vec![ScalarValue::Int64(3)],
        ]
    );

    let collectors = run(
        "SELECT COUNT(DISTINCT score) AS d, COUNT(*) AS n FROM s",
        vec![
            vec![ScalarValue::Int64(1), ScalarValue::Float64(1.0)],
            vec![ScalarValue::Int64(2), ScalarValue::Float64(1.0)],
            vec![ScalarValue::Int64(3), ScalarValue::Null],
        ],
        &[],
    )
    .await;
    assert_eq!(
        collectors[0].rows().expect("rows"),
        vec![vec![ScalarValue::Int64(1), ScalarValue::Int64(3)]]
    );
}
