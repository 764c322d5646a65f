//! Running instances of a [`Plan`].
//!
//! Lifecycle: [`RunningPipeline::instantiate`] resolves parameters and opens
//! the injector channels; callers then take row producers and attach
//! listeners; [`RunningPipeline::start`] spawns one task per node plus a
//! supervisor that reports the [`PipelineOutcome`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use svq_common::{EngineConfig, NodeId, Result, SvqError};
use svq_planner::{BranchTarget, OperatorKind, OperatorNode, Plan, RowSchema};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::eval::resolve_parameters;
use crate::listener::RowListener;
use crate::operators::{run_node, NodeOutputs};
use crate::stream::{bounded_row_channel, BridgeMessage, RowInputs, RowSender, StopSignal};
use crate::value::Row;

/// How a pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    /// Every node consumed all of its input.
    Finished,
    /// A stop request unwound the tasks; no node failed on its own.
    Stopped,
    /// At least one node failed.
    Failed,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStatus::Finished => "finished",
            PipelineStatus::Stopped => "stopped",
            PipelineStatus::Failed => "failed",
        })
    }
}

/// Final report of one pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Name of the pipeline.
    pub pipeline: String,
    /// Overall status.
    pub status: PipelineStatus,
    /// First failure; set exactly when `status` is [`PipelineStatus::Failed`].
    pub error: Option<SvqError>,
}

/// Callback invoked once by the supervisor when every task has ended.
pub type CompletionListener = Box<dyn FnOnce(&PipelineOutcome) + Send>;

/// Cloneable handle that stops one pipeline.
#[derive(Debug, Clone)]
pub struct StopHandle {
    signal: StopSignal,
}

impl StopHandle {
    /// Request a stop; idempotent.
    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.signal.is_stopped()
    }
}

/// Write side of an injector node.
///
/// Rows are delivered in order; [`RowProducer::finish`] sends end-of-rows
/// exactly once.
pub struct RowProducer {
    pipeline: String,
    node: String,
    sender: RowSender,
    stop: StopSignal,
    finished: bool,
}

impl RowProducer {
    /// Hand one row to the injector, waiting while its channel is full.
    pub async fn put_row(&mut self, row: Row) -> Result<()> {
        if self.finished {
            return Err(SvqError::Execution(format!(
                "row after end of rows for injector '{}' of pipeline '{}'",
                self.node, self.pipeline
            )));
        }
        self.sender.send(BridgeMessage::Row(row), &self.stop).await
    }

    /// Signal end of rows; later calls do nothing.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sender.send(BridgeMessage::EndOfRows, &self.stop).await
    }

    /// Whether end of rows was already sent.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// A plan instance with its own channels, listeners and stop signal.
pub struct RunningPipeline {
    name: Arc<str>,
    nodes: Vec<OperatorNode>,
    plan: Arc<Plan>,
    channel_capacity: usize,
    stop: StopSignal,
    injector_inputs: HashMap<NodeId, mpsc::Receiver<BridgeMessage>>,
    producers: HashMap<NodeId, RowSender>,
    row_listeners: HashMap<NodeId, Vec<Box<dyn RowListener>>>,
    completion_listeners: Vec<CompletionListener>,
    outcome: Option<oneshot::Receiver<PipelineOutcome>>,
    started: bool,
}

impl RunningPipeline {
    /// Prepare `plan` for one run; every filter parameter must have a value
    /// in `params`.
    pub fn instantiate(
        plan: Arc<Plan>,
        params: &BTreeMap<String, String>,
        config: &EngineConfig,
    ) -> Result<Self> {
        plan.validate()?;
        let mut nodes = plan.nodes().to_vec();
        for node in &mut nodes {
            if let OperatorKind::Filter(cfg) = &mut node.kind {
                cfg.condition = resolve_parameters(&cfg.condition, params)?;
            }
        }
        let mut injector_inputs = HashMap::new();
        let mut producers = HashMap::new();
        for node in nodes.iter().filter(|n| matches!(n.kind, OperatorKind::Injector)) {
            let (tx, rx) = bounded_row_channel(config.channel_capacity);
            injector_inputs.insert(node.id, rx);
            producers.insert(node.id, tx);
        }
        let stop = StopSignal::new();
        debug!(pipeline = plan.name(), nodes = nodes.len(), "instantiated pipeline");
        Ok(Self {
            name: Arc::from(plan.name()),
            nodes,
            plan,
            channel_capacity: config.channel_capacity,
            stop,
            injector_inputs,
            producers,
            row_listeners: HashMap::new(),
            completion_listeners: vec![],
            outcome: None,
            started: false,
        })
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The plan this instance runs.
    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    /// Names of all nodes, in plan order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Take the producer feeding injector `node`; each producer can be taken
    /// once.
    pub fn row_producer(&mut self, node: NodeId) -> Result<RowProducer> {
        let name = self.node(node)?.name.clone();
        let sender = self.producers.remove(&node).ok_or_else(|| {
            SvqError::Execution(format!(
                "node '{name}' of pipeline '{}' is not an injector or its producer was already taken",
                self.name
            ))
        })?;
        Ok(RowProducer {
            pipeline: self.name.to_string(),
            node: name,
            sender,
            stop: self.stop.clone(),
            finished: false,
        })
    }

    /// Observe the rows written by the node named `node_name`.
    pub fn add_row_listener(&mut self, node_name: &str, listener: Box<dyn RowListener>) -> Result<()> {
        if self.started {
            return Err(SvqError::Execution(format!(
                "pipeline '{}' already started",
                self.name
            )));
        }
        let id = self
            .nodes
            .iter()
            .find(|n| n.name == node_name)
            .map(|n| n.id)
            .ok_or_else(|| {
                SvqError::Execution(format!(
                    "pipeline '{}' has no node named '{node_name}'",
                    self.name
                ))
            })?;
        self.row_listeners.entry(id).or_default().push(listener);
        Ok(())
    }

    /// Register a callback for the end of the run.
    pub fn add_completion_listener(&mut self, listener: CompletionListener) {
        self.completion_listeners.push(listener);
    }

    /// Handle that stops this pipeline from anywhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            signal: self.stop.clone(),
        }
    }

    /// Request a stop; pending sends and receives return `Cancelled`.
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Whether [`RunningPipeline::start`] succeeded.
    pub fn is_started(&self) -> bool {
        self.started
    }

    fn node(&self, id: NodeId) -> Result<&OperatorNode> {
        self.nodes.get(id.0).ok_or_else(|| {
            SvqError::Execution(format!("unknown node {id} in pipeline '{}'", self.name))
        })
    }

    /// Spawn one task per node and the supervisor. Must run inside a tokio
    /// runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(SvqError::Execution(format!(
                "pipeline '{}' already started",
                self.name
            )));
        }
        if let Some(id) = self.producers.keys().min() {
            return Err(SvqError::Execution(format!(
                "injector '{}' of pipeline '{}' has no row producer attached",
                self.node(*id)?.name,
                self.name
            )));
        }

        let mut inputs: HashMap<NodeId, Vec<mpsc::Receiver<BridgeMessage>>> = HashMap::new();
        for (id, rx) in self.injector_inputs.drain() {
            inputs.entry(id).or_default().push(rx);
        }
        let mut outputs: HashMap<NodeId, NodeOutputs> = HashMap::new();
        for node in &self.nodes {
            outputs.insert(
                node.id,
                NodeOutputs {
                    pipeline: Arc::clone(&self.name),
                    schema: node.schema.clone(),
                    main: vec![],
                    on_true: None,
                    on_false: None,
                    listeners: self.row_listeners.remove(&node.id).unwrap_or_default(),
                    rows_out: 0,
                },
            );
        }
        let mut input_schemas: HashMap<NodeId, RowSchema> = HashMap::new();
        for edge in self.plan.edges() {
            let (tx, rx) = bounded_row_channel(self.channel_capacity);
            inputs.entry(edge.to).or_default().push(rx);
            input_schemas
                .entry(edge.to)
                .or_insert_with(|| self.nodes[edge.from.0].schema.clone());
            let out = outputs.get_mut(&edge.from).ok_or_else(|| {
                SvqError::Execution(format!("edge from unknown node {}", edge.from))
            })?;
            match edge.branch {
                None => out.main.push(tx),
                Some(BranchTarget::True) => out.on_true = Some(tx),
                Some(BranchTarget::False) => out.on_false = Some(tx),
            }
        }

        let mut handles = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let name = node.name.clone();
            let task = run_node(
                node.clone(),
                input_schemas.remove(&node.id).unwrap_or_else(RowSchema::empty),
                RowInputs::new(inputs.remove(&node.id).unwrap_or_default()),
                outputs.remove(&node.id).ok_or_else(|| {
                    SvqError::Execution(format!("node '{name}' has no outputs"))
                })?,
                self.stop.clone(),
            );
            handles.push((name, tokio::spawn(task)));
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let completion = std::mem::take(&mut self.completion_listeners);
        let stop = self.stop.clone();
        let pipeline = self.name.to_string();
        info!(pipeline = %pipeline, tasks = handles.len(), "pipeline started");
        tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> = handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.await) })
                .collect();
            let mut failure: Option<SvqError> = None;
            let mut cancelled = false;
            while let Some((operator, joined)) = pending.next().await {
                let result = joined.unwrap_or_else(|e| {
                    Err(SvqError::Execution(format!("operator task '{operator}' panicked: {e}")))
                });
                match result {
                    Ok(_) => {}
                    Err(e) if e.is_cancelled() => cancelled = true,
                    Err(e) => {
                        if failure.is_none() {
                            error!(pipeline = %pipeline, operator = %operator, error = %e, "operator failed; stopping pipeline");
                            stop.stop();
                            failure = Some(e);
                        }
                    }
                }
            }
            let status = match (&failure, cancelled) {
                (Some(_), _) => PipelineStatus::Failed,
                (None, true) => PipelineStatus::Stopped,
                (None, false) => PipelineStatus::Finished,
            };
            info!(pipeline = %pipeline, status = %status, "pipeline ended");
            let outcome = PipelineOutcome {
                pipeline,
                status,
                error: failure,
            };
            for listener in completion {
                listener(&outcome);
            }
            let _ = outcome_tx.send(outcome);
        });
        self.outcome = Some(outcome_rx);
        self.started = true;
        Ok(())
    }

    /// Wait for the supervisor's report; a failed run returns its first
    /// error.
    pub async fn wait_until_finished(&mut self) -> Result<PipelineStatus> {
        let rx = self.outcome.take().ok_or_else(|| {
            SvqError::Execution(format!(
                "pipeline '{}' is not running or was already awaited",
                self.name
            ))
        })?;
        let outcome = rx.await.map_err(|_| {
            SvqError::Execution(format!("supervisor of pipeline '{}' vanished", self.name))
        })?;
        match outcome.error {
            Some(e) => Err(e),
            None => Ok(outcome.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::listener::RowCollector;
    use crate::value::ScalarValue;
    use arrow_schema::DataType;
    use svq_planner::{ColumnDef, LiteralValue, PlanGraph, SampleConfig};

    fn schema() -> RowSchema {
        RowSchema::new(vec![ColumnDef::new("a", DataType::Int64)]).expect("schema")
    }

    fn injected(limit: Option<usize>) -> Arc<Plan> {
        let mut g = PlanGraph::new("test");
        let entry = g.add_node("Injector", OperatorKind::Injector, schema());
        let mut tail = entry;
        if let Some(n) = limit {
            let sample = g.add_node(
                "Limit",
                OperatorKind::Sample(SampleConfig {
                    first_row: 1,
                    last_row: n,
                }),
                schema(),
            );
            g.connect(tail, sample);
            tail = sample;
        }
        let exit = g.add_node("Result", OperatorKind::Dummy, schema());
        g.connect(tail, exit);
        Arc::new(g.finish(entry, exit).expect("plan"))
    }

    #[tokio::test]
    async fn producer_rows_reach_the_exit() {
        let mut p = RunningPipeline::instantiate(injected(Some(2)), &BTreeMap::new(), &EngineConfig::default())
            .expect("instantiate");
        let collector = RowCollector::new();
        p.add_row_listener("Result", Box::new(collector.clone())).expect("listener");
        let mut producer = p.row_producer(NodeId(0)).expect("producer");
        assert!(p.row_producer(NodeId(0)).is_err());
        p.start().expect("start");
        for v in 1..=5 {
            producer.put_row(vec![ScalarValue::Int64(v)]).await.expect("put");
        }
        producer.finish().await.expect("finish");
        producer.finish().await.expect("second finish is a no-op");
        assert_eq!(p.wait_until_finished().await.expect("wait"), PipelineStatus::Finished);
        assert_eq!(
            collector.rows().expect("rows"),
            vec![vec![ScalarValue::Int64(1)], vec![ScalarValue::Int64(2)]]
        );
        assert!(collector.is_finished().expect("state"));
    }

    #[tokio::test]
    async fn start_requires_a_producer_for_each_injector() {
        let mut p = RunningPipeline::instantiate(injected(None), &BTreeMap::new(), &EngineConfig::default())
            .expect("instantiate");
        assert!(matches!(p.start(), Err(SvqError::Execution(_))));
    }

    #[tokio::test]
    async fn stop_reports_stopped_and_calls_completion_listeners() {
        let mut p = RunningPipeline::instantiate(injected(None), &BTreeMap::new(), &EngineConfig::default())
            .expect("instantiate");
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        p.add_completion_listener(Box::new(move |o: &PipelineOutcome| {
            *sink.lock().expect("lock") = Some(o.status);
        }));
        let mut producer = p.row_producer(NodeId(0)).expect("producer");
        p.start().expect("start");
        producer.put_row(vec![ScalarValue::Int64(1)]).await.expect("put");
        p.stop();
        assert_eq!(p.wait_until_finished().await.expect("wait"), PipelineStatus::Stopped);
        assert_eq!(*seen.lock().expect("lock"), Some(PipelineStatus::Stopped));
        assert!(producer.put_row(vec![ScalarValue::Int64(2)]).await.is_err());
    }

    #[tokio::test]
    async fn operator_failure_fails_the_pipeline() {
        let mut g = PlanGraph::new("bad-source");
        let src = g.add_node(
            "Rows",
            OperatorKind::RowSource(vec![vec![LiteralValue::Utf8("not a number".into())]]),
            schema(),
        );
        let exit = g.add_node("Result", OperatorKind::Dummy, schema());
        g.connect(src, exit);
        let plan = Arc::new(g.finish(src, exit).expect("plan"));
        let mut p = RunningPipeline::instantiate(plan, &BTreeMap::new(), &EngineConfig::default())
            .expect("instantiate");
        p.start().expect("start");
        let err = p.wait_until_finished().await.expect_err("must fail");
        assert!(matches!(err, SvqError::Execution(_)));
    }
}
