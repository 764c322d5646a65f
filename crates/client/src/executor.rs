use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use svq_common::{global_metrics, EngineConfig, ExecutionId, Result, SvqError};
use svq_execution::{
    CompletionListener, PipelineOutcome, PipelineStatus, RowListener, RunningPipeline, StopHandle,
};
use svq_planner::{bind_query, extract_parameters, Plan, PlanBuilder, Query, RowSchema};
use tracing::{info, warn};

use crate::bridge::RowBridge;
use crate::catalog::{ServiceDefinition, ServiceResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Unprepared,
    Prepared,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BridgeState::Unprepared => "unprepared",
            BridgeState::Prepared => "prepared",
            BridgeState::Running => "running",
            BridgeState::Finished => "finished",
            BridgeState::Failed => "failed",
        })
    }
}

/// Runs one query against one service: resolves the service, compiles the
/// query into a generated pipeline, wires the service output into it and
/// streams the result rows to a caller listener.
///
/// A bridge serves exactly one execution.
pub struct ExecutionBridge {
    id: ExecutionId,
    query: Query,
    resolver: Arc<dyn ServiceResolver>,
    config: EngineConfig,
    state: BridgeState,
    service: Option<ServiceDefinition>,
    service_schema: Option<RowSchema>,
    pipeline_name: String,
    caller_parameters: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
    plan: Option<Arc<Plan>>,
    generated: Option<RunningPipeline>,
    service_pipeline: Option<RunningPipeline>,
    started_at: Option<Instant>,
}

impl ExecutionBridge {
    pub fn new(query: Query, resolver: Arc<dyn ServiceResolver>, config: EngineConfig) -> Self {
        Self {
            id: ExecutionId::next(),
            query,
            resolver,
            config,
            state: BridgeState::Unprepared,
            service: None,
            service_schema: None,
            pipeline_name: String::new(),
            caller_parameters: BTreeMap::new(),
            parameters: BTreeMap::new(),
            plan: None,
            generated: None,
            service_pipeline: None,
            started_at: None,
        }
    }

    /// Parameter values applied over the service defaults; pushed-down WHERE
    /// equalities still win.
    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.caller_parameters = parameters;
        self
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Output schema of the service; empty for queries without FROM.
    pub fn service_schema(&self) -> Option<&RowSchema> {
        self.service_schema.as_ref()
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_deref()
    }

    pub fn result_schema(&self) -> Option<&RowSchema> {
        self.plan().map(Plan::result_schema)
    }

    /// Effective parameters handed to the pipelines.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    fn fail<T>(&mut self, e: SvqError) -> Result<T> {
        self.state = BridgeState::Failed;
        Err(e)
    }

    /// Resolve the service and its output schema; fix the generated pipeline
    /// name.
    pub fn prepare(&mut self) -> Result<()> {
        if self.state != BridgeState::Unprepared {
            return Err(SvqError::Execution(format!(
                "cannot prepare an execution bridge in state {}",
                self.state
            )));
        }
        match self.resolve_service() {
            Ok(()) => {
                self.state = BridgeState::Prepared;
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn resolve_service(&mut self) -> Result<()> {
        let schema = match &self.query.service {
            Some(name) => {
                let service = self.resolver.load_service(name)?;
                let schema = service.output_node()?.schema.clone();
                self.service = Some(service);
                schema
            }
            None => RowSchema::empty(),
        };
        self.pipeline_name = format!("{}-{}", self.config.generated_pipeline_prefix, self.id);
        info!(
            pipeline = %self.pipeline_name,
            service = self.query.service.as_deref().unwrap_or("-"),
            columns = schema.len(),
            "prepared execution bridge"
        );
        self.service_schema = Some(schema);
        Ok(())
    }

    /// Bind the query, extract pushdown parameters and build the generated
    /// plan without starting anything. Prepares the bridge first if needed.
    pub fn compile(&mut self) -> Result<&Plan> {
        if self.state == BridgeState::Unprepared {
            self.prepare()?;
        }
        if self.state != BridgeState::Prepared {
            return Err(SvqError::Execution(format!(
                "cannot compile a query in state {}",
                self.state
            )));
        }
        if self.plan.is_none() {
            match self.build_plan() {
                Ok(plan) => self.plan = Some(Arc::new(plan)),
                Err(e) => return self.fail(e),
            }
        }
        self.plan
            .as_deref()
            .ok_or_else(|| SvqError::Execution("plan missing after compilation".to_string()))
    }

    fn build_plan(&mut self) -> Result<Plan> {
        let schema = self.service_schema.clone().unwrap_or_default();
        bind_query(&self.query, &schema)?;
        let mut parameters = self
            .service
            .as_ref()
            .map(|s| s.parameters.clone())
            .unwrap_or_default();
        parameters.extend(self.caller_parameters.clone());
        if let Some(condition) = &self.query.where_condition {
            parameters.extend(extract_parameters(condition));
        }
        let plan = PlanBuilder::new(&self.pipeline_name, schema).build(&self.query, self.config.max_rows)?;
        self.parameters = parameters;
        Ok(plan)
    }

    /// Compile, instantiate both pipelines, attach the row bridge and
    /// `listener` (on the plan's exit node) and start them, generated
    /// pipeline first.
    pub async fn execute_query(&mut self, listener: Box<dyn RowListener>) -> Result<()> {
        self.compile()?;
        match self.start_pipelines(listener) {
            Ok(()) => {
                self.state = BridgeState::Running;
                self.started_at = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.stop();
                self.fail(e)
            }
        }
    }

    fn start_pipelines(&mut self, listener: Box<dyn RowListener>) -> Result<()> {
        let plan = self
            .plan
            .clone()
            .ok_or_else(|| SvqError::Execution("query was not compiled".to_string()))?;
        let mut generated = RunningPipeline::instantiate(Arc::clone(&plan), &self.parameters, &self.config)?;
        generated.add_row_listener(&plan.exit_node().name, listener)?;

        let mut service_pipeline = match &self.service {
            Some(service) => {
                let mut pipeline = RunningPipeline::instantiate(
                    Arc::new(service.pipeline.clone()),
                    &self.parameters,
                    &self.config,
                )?;
                let producer = generated.row_producer(plan.entry())?;
                pipeline.add_row_listener(
                    &service.output,
                    Box::new(RowBridge::new(service.name.clone(), producer)),
                )?;
                pipeline.add_completion_listener(stop_on_failure(generated.stop_handle()));
                generated.add_completion_listener(stop_on_failure(pipeline.stop_handle()));
                Some(pipeline)
            }
            None => None,
        };

        generated.start()?;
        self.generated = Some(generated);
        if let Some(pipeline) = service_pipeline.as_mut() {
            pipeline.start()?;
        }
        self.service_pipeline = service_pipeline;
        info!(
            pipeline = %self.pipeline_name,
            service = self.query.service.as_deref().unwrap_or("-"),
            parameters = ?self.parameters,
            "query started"
        );
        Ok(())
    }

    /// Stop both pipelines; running tasks unwind with `Cancelled`.
    pub fn stop(&self) {
        for p in [&self.generated, &self.service_pipeline].into_iter().flatten() {
            p.stop();
        }
    }

    /// Wait for both pipelines; returns the first failure, the service's
    /// when both failed.
    pub async fn wait_until_finished(&mut self) -> Result<()> {
        if self.state != BridgeState::Running {
            return Err(SvqError::Execution(format!(
                "no running query to wait for (state {})",
                self.state
            )));
        }
        let service = match self.service_pipeline.as_mut() {
            Some(p) => Some(p.wait_until_finished().await),
            None => None,
        };
        let generated = match self.generated.as_mut() {
            Some(p) => p.wait_until_finished().await,
            None => Err(SvqError::Execution("generated pipeline missing".to_string())),
        };
        let result = match (service, generated) {
            (Some(Err(e)), _) | (_, Err(e)) => Err(e),
            (Some(Ok(PipelineStatus::Stopped)), _) | (_, Ok(PipelineStatus::Stopped)) => Err(
                SvqError::Cancelled(format!("query {} was stopped", self.pipeline_name)),
            ),
            _ => Ok(()),
        };
        let outcome = match &result {
            Ok(()) => "finished",
            Err(e) if e.is_cancelled() => "stopped",
            Err(_) => "failed",
        };
        let secs = self
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        global_metrics().record_query(self.query.service.as_deref().unwrap_or("-"), outcome, secs);
        match &result {
            Ok(()) => {
                self.state = BridgeState::Finished;
                info!(pipeline = %self.pipeline_name, secs, "query finished");
            }
            Err(e) => {
                self.state = BridgeState::Failed;
                warn!(pipeline = %self.pipeline_name, error = %e, "query did not finish");
            }
        }
        result
    }
}

fn stop_on_failure(other: StopHandle) -> CompletionListener {
    Box::new(move |outcome: &PipelineOutcome| {
        if outcome.status != PipelineStatus::Finished {
            other.stop();
        }
    })
}
