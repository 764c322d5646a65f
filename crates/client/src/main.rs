use std::sync::Arc;

use arrow::util::pretty::pretty_format_batches;
use svq_client::{ExecutionBridge, ServiceCatalog};
use svq_common::{global_metrics, EngineConfig};
use svq_execution::RowCollector;
use svq_planner::{explain_plan, sql_to_query};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct QueryOpts {
    sql: String,
    plan_only: bool,
    catalog: Option<String>,
    metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let config = EngineConfig::from_env()?;
    let Some(opts) = parse_query_opts(&args, &config)? else {
        print_usage();
        return Ok(());
    };

    let catalog = match &opts.catalog {
        Some(path) => ServiceCatalog::load(path)?,
        None => ServiceCatalog::new(),
    };
    let query = sql_to_query(&opts.sql)?;
    let mut bridge = ExecutionBridge::new(query, Arc::new(catalog), config);

    if opts.plan_only {
        println!("{}", explain_plan(bridge.compile()?));
        return Ok(());
    }

    let collector = RowCollector::new();
    bridge.execute_query(Box::new(collector.clone())).await?;
    bridge.wait_until_finished().await?;

    let schema = bridge
        .result_schema()
        .cloned()
        .ok_or("query finished without a result schema")?;
    let batch = collector.to_record_batch(&schema)?;
    if batch.num_rows() == 0 {
        println!("OK: 0 rows");
    } else {
        println!("{}", pretty_format_batches(&[batch])?);
    }
    if opts.metrics {
        eprintln!("{}", global_metrics().render_prometheus());
    }
    Ok(())
}

/// `None` when only usage was requested.
fn parse_query_opts(
    args: &[String],
    config: &EngineConfig,
) -> Result<Option<QueryOpts>, Box<dyn std::error::Error>> {
    let mut sql = None;
    let mut plan_only = false;
    let mut metrics = false;
    let mut catalog = config.service_catalog.clone();

    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--catalog" => {
                i += 1;
                catalog = Some(args.get(i).cloned().ok_or("missing value for --catalog")?);
            }
            "--plan" => plan_only = true,
            "--metrics" => metrics = true,
            "--help" | "-h" => return Ok(None),
            other if other.starts_with("--") => {
                return Err(format!("unknown argument: {other}").into());
            }
            other => {
                if sql.is_some() {
                    return Err("expected a single SQL argument".into());
                }
                sql = Some(other.to_string());
            }
        }
        i += 1;
    }

    let Some(sql) = sql else {
        return Ok(None);
    };
    Ok(Some(QueryOpts {
        sql,
        plan_only,
        catalog,
        metrics,
    }))
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  svq [--catalog PATH] \"<SQL>\"");
    eprintln!("  svq [--catalog PATH] --plan \"<SQL>\"");
    eprintln!("  svq [--catalog PATH] --metrics \"<SQL>\"");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  SVQ_SERVICE_CATALOG   default for --catalog");
    eprintln!("  SVQ_CHANNEL_CAPACITY  rows buffered per operator edge");
    eprintln!("  SVQ_MAX_ROWS          cap on result rows (0 = none)");
    eprintln!("  RUST_LOG              tracing filter");
}
