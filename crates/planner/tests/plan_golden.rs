use std::fs;
use std::path::{Path, PathBuf};

use arrow_schema::DataType;
use svq_planner::{explain_plan, sql_to_query, ColumnDef, PlanBuilder, RowSchema};

fn service_schema() -> RowSchema {
    RowSchema::new(vec![
        ColumnDef::new("a", DataType::Int64),
        ColumnDef::new("b", DataType::Utf8).with_length(20, None),
    ])
    .expect("schema")
}

fn plan_snapshot(name: &str, sql: &str) {
    let query = sql_to_query(sql).expect("parse");
    let plan = PlanBuilder::new("sql", service_schema())
        .build(&query, query.limit.unwrap_or(0))
        .expect("build");
    let snapshot = format!("# plan-golden: {name}\n-- {sql}\n\n{}", explain_plan(&plan));

    let path = snapshot_path(name);
    if should_bless() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create snapshot dir");
        }
        fs::write(&path, snapshot).expect("write snapshot");
        return;
    }

    let expected = fs::read_to_string(&path).unwrap_or_else(|_| {
        panic!(
            "missing snapshot at {}. Run with BLESS=1 to create it.",
            path.display()
        )
    });
    if expected != snapshot {
        panic!(
            "snapshot mismatch for {name}\npath: {}\n\n{}\n\nRun with BLESS=1 to accept changes.",
            path.display(),
            unified_diff(&expected, &snapshot)
        );
    }
}

fn should_bless() -> bool {
    matches!(std::env::var("BLESS").as_deref(), Ok("1"))
        || matches!(std::env::var("UPDATE_SNAPSHOTS").as_deref(), Ok("1"))
}

fn snapshot_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
        .join("plans")
        .join(format!("{name}.snap"))
}

fn unified_diff(expected: &str, actual: &str) -> String {
    let exp: Vec<&str> = expected.lines().collect();
    let act: Vec<&str> = actual.lines().collect();
    let mut out = String::from("--- expected\n+++ actual\n");
    for i in 0..exp.len().max(act.len()) {
        match (exp.get(i), act.get(i)) {
            (Some(e), Some(a)) if e == a => out.push_str(&format!(" {:04} {e}\n", i + 1)),
            (Some(e), Some(a)) => {
                out.push_str(&format!("-{:04} {e}\n", i + 1));
                out.push_str(&format!("+{:04} {a}\n", i + 1));
            }
            (Some(e), None) => out.push_str(&format!("-{:04} {e}\n", i + 1)),
            (None, Some(a)) => out.push_str(&format!("+{:04} {a}\n", i + 1)),
            (None, None) => {}
        }
    }
    out
}

#[test]
fn golden_where_order_by() {
    plan_snapshot(
        "where_order_by",
        "SELECT a FROM svc WHERE a > 1 ORDER BY a DESC",
    );
}

#[test]
fn golden_count_having_limit() {
    plan_snapshot(
        "count_having_limit",
        "SELECT b, COUNT(*) AS n FROM svc GROUP BY b HAVING COUNT(*) > 1 ORDER BY n DESC LIMIT 10",
    );
}

#[test]
fn golden_iif_select() {
    plan_snapshot(
        "iif_select",
        "SELECT IIF(a > 1, 'big', 'small') AS size FROM svc",
    );
}
