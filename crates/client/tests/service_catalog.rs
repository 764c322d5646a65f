use std::sync::Arc;

use svq_client::{ExecutionBridge, ServiceCatalog, ServiceResolver};
use svq_common::EngineConfig;
use svq_execution::RowCollector;
use svq_planner::sql_to_query;

#[path = "support/mod.rs"]
mod support;

#[test]
fn demo_catalog_loads() {
    let catalog = ServiceCatalog::load_from_json_str(support::DEMO_CATALOG_JSON).expect("catalog");
    let names: Vec<_> = catalog.services().iter().map(|s| s.name.clone()).collect();
    assert_eq!(names, vec!["numbers", "orders"]);
    let orders = catalog.load_service("orders").expect("orders");
    assert_eq!(orders.output_node().expect("output").schema, support::orders_schema());
}

#[test]
fn catalog_round_trips_through_json() {
    let catalog = support::catalog();
    let json = catalog.to_json().expect("json");
    let back = ServiceCatalog::load_from_json_str(&json).expect("reload");
    for service in catalog.services() {
        let reloaded = back.load_service(&service.name).expect("service");
        assert_eq!(reloaded.pipeline.nodes(), service.pipeline.nodes());
        assert_eq!(reloaded.parameters, service.parameters);
    }
}

#[tokio::test]
async fn queries_run_against_the_demo_catalog() {
    let catalog = ServiceCatalog::load_from_json_str(support::DEMO_CATALOG_JSON).expect("catalog");
    let query = sql_to_query("SELECT region, COUNT(*) AS n FROM orders WHERE region = 'eu' GROUP BY region")
        .expect("parse");
    let mut bridge = ExecutionBridge::new(query, Arc::new(catalog), EngineConfig::default());
    let collector = RowCollector::new();
    bridge
        .execute_query(Box::new(collector.clone()))
        .await
        .expect("start");
    bridge.wait_until_finished().await.expect("finish");
    assert_eq!(
        collector.rows().expect("rows"),
        vec![vec![support::text("eu"), support::int(2)]]
    );
    let schema = bridge.result_schema().expect("schema").clone();
    let batch = collector.to_record_batch(&schema).expect("batch");
    assert_eq!(batch.num_rows(), 1);
    assert_eq!(batch.num_columns(), 2);
}
