use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_rows_out: CounterVec,
    bridge_rows: CounterVec,
    queries: CounterVec,
    query_seconds: HistogramVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_operator_rows(&self, pipeline: &str, operator: &str, rows_out: u64) {
        self.inner
            .operator_rows_out
            .with_label_values(&[pipeline, operator])
            .inc_by(rows_out as f64);
    }

    pub fn record_bridge_rows(&self, service: &str, rows: u64) {
        self.inner
            .bridge_rows
            .with_label_values(&[service])
            .inc_by(rows as f64);
    }

    /// `outcome` is `finished`, `failed` or `stopped`.
    pub fn record_query(&self, service: &str, outcome: &str, secs: f64) {
        self.inner
            .queries
            .with_label_values(&[service, outcome])
            .inc();
        self.inner
            .query_seconds
            .with_label_values(&[service])
            .observe(secs.max(0.0));
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_rows_out = counter_vec(
            &registry,
            "svq_operator_rows_out_total",
            "Rows emitted per pipeline operator",
            &["pipeline", "operator"],
        );
        let bridge_rows = counter_vec(
            &registry,
            "svq_bridge_rows_total",
            "Rows handed from a service pipeline to a generated pipeline",
            &["service"],
        );
        let queries = counter_vec(
            &registry,
            "svq_queries_total",
            "Completed query executions by outcome",
            &["service", "outcome"],
        );
        let query_seconds = histogram_vec(
            &registry,
            "svq_query_seconds",
            "Wall time from start to completion of both pipelines",
            &["service"],
        );

        Self {
            registry,
            operator_rows_out,
            bridge_rows,
            queries,
            query_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_operator_rows("sql_orders", "Filter", 10);
        let text = m.render_prometheus();
        assert!(text.contains("svq_operator_rows_out_total"));
        assert!(text.contains("Filter"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.record_operator_rows("sql_orders", "Sort", 4);
        m.record_bridge_rows("orders", 4);
        m.record_query("orders", "finished", 0.02);
        let text = m.render_prometheus();

        assert!(text.contains("svq_operator_rows_out_total"));
        assert!(text.contains("svq_bridge_rows_total"));
        assert!(text.contains("svq_queries_total"));
        assert!(text.contains("svq_query_seconds"));
    }
}
