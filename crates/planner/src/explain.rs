use crate::plan::{OperatorKind, OperatorNode, Plan};

/// Render a plan as human-readable multiline text, one node per block in
/// topological order.
pub fn explain_plan(plan: &Plan) -> String {
    let mut out = format!(
        "Plan {} entry={} exit={}\n",
        plan.name(),
        plan.entry_node().name,
        plan.exit_node().name
    );
    let order = plan
        .topological_order()
        .unwrap_or_else(|_| plan.nodes().iter().map(|n| n.id).collect());
    for id in order {
        let Some(node) = plan.node(id) else { continue };
        out.push_str(&format!(
            "{id} {} [{}]{}\n",
            node.name,
            node.kind.type_name(),
            fmt_details(node)
        ));
        out.push_str(&format!("  schema={}\n", fmt_schema(node)));
        for e in plan.outgoing(id) {
            let target = plan.node(e.to).map(|n| n.name.as_str()).unwrap_or("?");
            match e.branch {
                Some(b) => out.push_str(&format!("  -> {target} ({b})\n")),
                None => out.push_str(&format!("  -> {target}\n")),
            }
        }
    }
    out
}

fn fmt_details(node: &OperatorNode) -> String {
    match &node.kind {
        OperatorKind::Injector | OperatorKind::SingleEmptyRow | OperatorKind::Dummy => {
            String::new()
        }
        OperatorKind::ConstantRow(fields) => {
            let parts = fields
                .iter()
                .map(|c| format!("{} := {}", c.name, c.value))
                .collect::<Vec<_>>();
            format!(" {}", parts.join(", "))
        }
        OperatorKind::CopyField(c) => format!(" {} := ${}", c.target, c.source),
        OperatorKind::Filter(cfg) => format!(" {}", cfg.condition),
        OperatorKind::GroupBy(cfg) => {
            let keys = cfg
                .keys
                .iter()
                .map(|k| format!("${k}"))
                .collect::<Vec<_>>();
            let aggs = cfg
                .aggregates
                .iter()
                .map(|a| format!("{} := {:?}(${})", a.output, a.kind, a.subject))
                .collect::<Vec<_>>();
            let mut s = format!(" keys=[{}] aggs=[{}]", keys.join(", "), aggs.join(", "));
            if cfg.always_emit_one_row {
                s.push_str(" always_emit_one_row");
            }
            s
        }
        OperatorKind::Sort(keys) => {
            let parts = keys
                .iter()
                .map(|k| format!("${} {}", k.column, if k.ascending { "ASC" } else { "DESC" }))
                .collect::<Vec<_>>();
            format!(" {}", parts.join(", "))
        }
        OperatorKind::Project(fields) => {
            let parts = fields
                .iter()
                .map(|f| format!("${} AS {}", f.source, f.output))
                .collect::<Vec<_>>();
            format!(" {}", parts.join(", "))
        }
        OperatorKind::Sample(cfg) => format!(" rows {}..={}", cfg.first_row, cfg.last_row),
        OperatorKind::RowSource(rows) => format!(" rows={}", rows.len()),
    }
}

fn fmt_schema(node: &OperatorNode) -> String {
    let cols = node
        .schema
        .columns()
        .iter()
        .map(|c| format!("{}:{:?}", c.name, c.data_type))
        .collect::<Vec<_>>();
    format!("[{}]", cols.join(", "))
}
