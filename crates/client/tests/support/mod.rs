#![allow(dead_code)]

use std::sync::Arc;

use arrow_schema::DataType;
use svq_client::{ExecutionBridge, ServiceCatalog, ServiceDefinition};
use svq_common::{EngineConfig, Result};
use svq_execution::{Row, RowCollector, ScalarValue};
use svq_planner::{
    BoundCondition, BoundOperand, ColumnDef, ComparisonOp, FilterConfig, LiteralValue,
    OperatorKind, Plan, PlanGraph, RowSchema, sql_to_query,
};

pub const DEMO_CATALOG_JSON: &str = include_str!("../../../../demos/services.json");

/// Service whose output node emits `rows` under `schema`.
pub fn static_service(name: &str, schema: RowSchema, rows: Vec<Vec<LiteralValue>>) -> ServiceDefinition {
    let mut g = PlanGraph::new(name);
    let src = g.add_node("Rows", OperatorKind::RowSource(rows), schema.clone());
    let out = g.add_node("Output", OperatorKind::Dummy, schema);
    g.connect(src, out);
    ServiceDefinition::new(name, g.finish(src, out).expect("service plan"), "Output")
}

fn orders_plan() -> Plan {
    let schema = orders_schema();
    let rows = [
        (1, "eu", 10.0),
        (2, "us", 20.0),
        (3, "eu", 5.5),
        (4, "apac", 7.0),
        (5, "us", 20.0),
    ]
    .into_iter()
    .map(|(id, region, amount)| {
        vec![
            LiteralValue::Int64(id),
            LiteralValue::Utf8(region.to_string()),
            LiteralValue::Float64(amount),
        ]
    })
    .collect();
    // region = :region OR :region = '*'
    let by_region = BoundCondition::Or(vec![
        BoundCondition::Atom {
            left: BoundOperand::Column(1),
            op: ComparisonOp::Eq,
            right: BoundOperand::Parameter("region".to_string()),
        },
        BoundCondition::Atom {
            left: BoundOperand::Parameter("region".to_string()),
            op: ComparisonOp::Eq,
            right: BoundOperand::Literal(LiteralValue::Utf8("*".to_string())),
        },
    ]);
    let mut g = PlanGraph::new("orders");
    let src = g.add_node("Rows", OperatorKind::RowSource(rows), schema.clone());
    let filter = g.add_node(
        "Region",
        OperatorKind::Filter(FilterConfig::new(by_region)),
        schema.clone(),
    );
    let out = g.add_node("Output", OperatorKind::Dummy, schema);
    g.connect(src, filter);
    g.connect(filter, out);
    g.finish(src, out).expect("orders plan")
}

pub fn orders_schema() -> RowSchema {
    RowSchema::new(vec![
        ColumnDef::new("id", DataType::Int64),
        ColumnDef::new("region", DataType::Utf8).with_length(8, None),
        ColumnDef::new("amount", DataType::Float64),
    ])
    .expect("orders schema")
}

/// `numbers` (a = 1, 2, 3), `orders` (region pushdown parameter, default
/// `*`), `empty` (no rows) and `broken` (a value that fails to convert).
pub fn catalog() -> ServiceCatalog {
    let a = RowSchema::new(vec![ColumnDef::new("a", DataType::Int64)]).expect("schema");
    let ax = RowSchema::new(vec![
        ColumnDef::new("a", DataType::Int64),
        ColumnDef::new("x", DataType::Float64),
    ])
    .expect("schema");
    let mut catalog = ServiceCatalog::new();
    catalog
        .register_service(static_service(
            "numbers",
            a.clone(),
            (1..=3).map(|v| vec![LiteralValue::Int64(v)]).collect(),
        ))
        .expect("numbers");
    catalog
        .register_service(
            ServiceDefinition::new("orders", orders_plan(), "Output").with_parameter("region", "*"),
        )
        .expect("orders");
    catalog
        .register_service(static_service("empty", ax, vec![]))
        .expect("empty");
    catalog
        .register_service(static_service(
            "broken",
            a,
            vec![
                vec![LiteralValue::Int64(1)],
                vec![LiteralValue::Utf8("oops".to_string())],
            ],
        ))
        .expect("broken");
    catalog
}

pub struct QueryRun {
    pub bridge: ExecutionBridge,
    pub rows: Vec<Row>,
}

/// Run `sql` to completion against [`catalog`].
pub async fn run(sql: &str) -> Result<QueryRun> {
    run_with(sql, EngineConfig::default()).await
}

pub async fn run_with(sql: &str, config: EngineConfig) -> Result<QueryRun> {
    let query = sql_to_query(sql)?;
    let mut bridge = ExecutionBridge::new(query, Arc::new(catalog()), config);
    let collector = RowCollector::new();
    bridge.execute_query(Box::new(collector.clone())).await?;
    bridge.wait_until_finished().await?;
    Ok(QueryRun {
        bridge,
        rows: collector.rows()?,
    })
}

pub fn int(v: i64) -> ScalarValue {
    ScalarValue::Int64(v)
}

pub fn text(v: &str) -> ScalarValue {
    ScalarValue::from(v)
}

pub fn float(v: f64) -> ScalarValue {
    ScalarValue::Float64(v)
}
