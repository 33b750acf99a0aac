//! Server and worker runners
//!
//! A run consists of exactly one server unit and any number of worker
//! units, all submitted to the same `ExecutionContext`. The server unit is
//! the only one producing a result fragment.

use std::sync::Arc;

use runtime_core::{
    Error, ExecutionContext, Job, JobSlot, ParticipantId, Result, ResultFragment,
    SlotAttribution, WorkerSlot, PERFORMANCE_KEY,
};
use serde_json::Value;
use tracing::{debug, info};

/// Coordinating role of a run
pub trait Server: Send {
    /// Run the server until training is finished
    fn start(&mut self) -> Result<()>;

    /// Statistics gathered by a finished server
    fn report(&self) -> ServerReport;
}

/// Participant role of a run
pub trait Worker: Send {
    /// Run the worker until its part of the run is finished
    fn start(&mut self) -> Result<()>;
}

/// What a finished server reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerReport {
    /// Performance statistic of the trained model
    pub performance: Value,

    /// Attribution table, present only for algorithms computing one
    pub shapley_values: Option<SlotAttribution>,
}

impl From<ServerReport> for ResultFragment {
    fn from(report: ServerReport) -> Self {
        let mut fragment = ResultFragment::new().with_metric(PERFORMANCE_KEY, report.performance);
        fragment.shapley_values = report.shapley_values;
        fragment
    }
}

/// Builds a server bound to a context
pub type ServerConstructor =
    Arc<dyn Fn(ExecutionContext) -> Result<Box<dyn Server>> + Send + Sync>;

/// Builds a worker bound to a context
pub type WorkerConstructor =
    Arc<dyn Fn(ExecutionContext) -> Result<Box<dyn Worker>> + Send + Sync>;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub constructor: ServerConstructor,
}

impl ServerConfig {
    pub fn new(constructor: ServerConstructor) -> Self {
        Self { constructor }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig").finish_non_exhaustive()
    }
}

/// Configuration of one worker slot
#[derive(Clone)]
pub struct WorkerConfig {
    /// Position of the worker in the run
    pub slot: WorkerSlot,

    /// Participant this slot trains for, if known
    pub practitioner: Option<ParticipantId>,

    pub constructor: WorkerConstructor,
}

impl WorkerConfig {
    pub fn new(slot: WorkerSlot, constructor: WorkerConstructor) -> Self {
        Self {
            slot,
            practitioner: None,
            constructor,
        }
    }

    pub fn with_practitioner(mut self, practitioner: impl Into<ParticipantId>) -> Self {
        self.practitioner = Some(practitioner.into());
        self
    }

    fn job_name(&self) -> String {
        format!("worker-{}", self.slot)
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("slot", &self.slot)
            .field("practitioner", &self.practitioner)
            .finish_non_exhaustive()
    }
}

/// Build, start and report a server
///
/// Blocks for as long as the server runs. Errors from construction or
/// `start` are returned unchanged.
pub fn start_server(context: ExecutionContext, server_config: ServerConfig) -> Result<ResultFragment> {
    let mut server = (server_config.constructor)(context.clone())?;
    debug!(context_id = %context.id(), "Server constructed");

    server.start()?;
    info!(context_id = %context.id(), "Stop server");

    Ok(server.report().into())
}

/// Build and start a worker, blocking until it finishes
pub fn run_worker(constructor: WorkerConstructor, context: ExecutionContext) -> Result<()> {
    let mut worker = constructor(context)?;
    worker.start()
}

/// Submit the server unit of a run
pub fn submit_server(context: &ExecutionContext, server_config: ServerConfig) -> Result<JobSlot> {
    let server_context = context.clone();
    let job = Job::new("server", move || {
        start_server(server_context, server_config).map(Some)
    });

    context
        .submit([job])?
        .pop()
        .ok_or_else(|| Error::Internal {
            message: "server submission returned no slot".to_string(),
        })
}

/// Submit one worker unit per config as a single batch
pub fn start_workers(
    context: &ExecutionContext,
    worker_configs: Vec<WorkerConfig>,
) -> Result<Vec<JobSlot>> {
    if worker_configs.is_empty() {
        return Err(Error::precondition("worker_configs must not be empty"));
    }

    debug!(
        worker_count = worker_configs.len(),
        "Run workers in the same batch"
    );

    let jobs: Vec<Job> = worker_configs
        .into_iter()
        .map(|worker_config| {
            let worker_context = context.clone();
            Job::new(worker_config.job_name(), move || {
                run_worker(worker_config.constructor, worker_context).map(|()| None)
            })
        })
        .collect();

    context.submit(jobs)
}
