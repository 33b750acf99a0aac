//! Training entry point and result collection
//!
//! `train` launches a run; with practitioners it registers an asynchronous
//! task and returns its id, without them it blocks until the run is done.
//! `get_training_result` polls an asynchronous task and hands out its final
//! statistics exactly once.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use runtime_core::logging::add_file_handler;
use runtime_core::{
    Error, ExecutionContext, ParticipantId, Practitioner, Result, TaskId, TrainingConfig,
    TrainingStats,
};
use tracing::{debug, info, warn};

use crate::attribution::assemble_stats;
use crate::layout::{WorkerConfigFactory, WorkerLayout};
use crate::registry::{TaskRecord, TaskRegistry, TaskSummary};
use crate::runner::{start_workers, submit_server, ServerConfig, WorkerConfig};

/// Launches training runs and tracks the asynchronous ones
///
/// Calls for different task ids may run concurrently. Calls for the same
/// task id must not overlap.
#[derive(Clone)]
pub struct Orchestrator {
    /// In-flight asynchronous tasks
    tasks: Arc<TaskRegistry>,

    /// Derives the layout of each run
    factory: Arc<dyn WorkerConfigFactory>,
}

impl Orchestrator {
    /// Create an orchestrator with its own task registry
    pub fn new(factory: Arc<dyn WorkerConfigFactory>) -> Self {
        Self::with_registry(factory, Arc::new(TaskRegistry::new()))
    }

    /// Create an orchestrator over an existing task registry
    pub fn with_registry(factory: Arc<dyn WorkerConfigFactory>, tasks: Arc<TaskRegistry>) -> Self {
        Self { tasks, factory }
    }

    pub fn task_registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&self.tasks)
    }

    /// Summaries of all tasks still registered
    pub fn running_tasks(&self) -> Vec<TaskSummary> {
        self.tasks.summaries()
    }

    /// Launch one training run
    ///
    /// Without practitioners the call blocks until the run is finished and
    /// returns `None`. With practitioners the run is registered as a task and
    /// its id is returned immediately.
    pub fn train(
        &self,
        config: &TrainingConfig,
        practitioners: Option<&BTreeSet<Practitioner>>,
    ) -> Result<Option<TaskId>> {
        // Each run works on its own snapshot
        let mut config = config.clone();
        let practitioners = practitioners.cloned();
        config.validate()?;
        config.reset_session();
        config.apply_global_config()?;
        let timer = Instant::now();

        let (task_id, practitioner_ids) = match &practitioners {
            None => {
                add_file_handler(config.log_file())?;
                (None, None)
            }
            Some(practitioners) => (
                Some(TaskId::mint()),
                Some(participant_ids(practitioners, config.worker_number)?),
            ),
        };

        let WorkerLayout {
            context,
            server,
            workers,
        } = self
            .factory
            .worker_config(&config, task_id, practitioners.as_ref())?;
        let server = server.ok_or_else(|| Error::precondition("worker layout has no server config"))?;

        let pool = context.executor_pool();
        if let Err(e) = launch(&context, server, workers) {
            pool.shutdown(false);
            return Err(e);
        }

        if let (Some(task_id), Some(practitioner_ids)) = (task_id, practitioner_ids) {
            let record = TaskRecord::new(Arc::clone(&pool), practitioner_ids, config);
            if let Err(e) = self.tasks.register(task_id, record) {
                pool.shutdown(false);
                return Err(e);
            }
            return Ok(Some(task_id));
        }

        let poll = match pool.wait_results(None) {
            Ok(poll) => poll,
            Err(e) => {
                pool.shutdown(false);
                return Err(e);
            }
        };
        for (slot, outcome) in poll.completed {
            match outcome {
                Ok(Some(fragment)) => debug!(
                    slot = slot,
                    metrics = ?fragment.metrics.keys().collect::<Vec<_>>(),
                    "Run produced results"
                ),
                Ok(None) => {}
                Err(e) => {
                    pool.shutdown(false);
                    return Err(e);
                }
            }
        }
        pool.shutdown(true);

        info!(
            elapsed_secs = timer.elapsed().as_secs_f64(),
            session = ?config.session_id,
            "Training finished"
        );
        Ok(None)
    }

    /// Poll an asynchronous task
    ///
    /// `timeout` bounds only this poll: `None` waits for the run to finish,
    /// `Some` returns `Ok(None)` if the run is still going once it expires.
    /// The statistics of a finished task are returned once, after which the
    /// task id is unknown.
    pub fn get_training_result(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<Option<TrainingStats>> {
        let pool = self.tasks.pool(task_id)?;
        let poll = pool.wait_results(timeout)?;

        let mut failure = None;
        for (slot, outcome) in poll.completed {
            match outcome {
                Ok(Some(fragment)) => self.tasks.merge_result(task_id, fragment)?,
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task_id, slot = slot, error = %e, "Task unit failed");
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            pool.shutdown(false);
            self.tasks.remove(task_id)?;
            warn!(task_id = %task_id, "Task discarded after failure");
            return Err(e);
        }

        if !poll.pending.is_empty() {
            debug!(
                task_id = %task_id,
                pending = poll.pending.len(),
                "Task still running"
            );
            return Ok(None);
        }

        pool.shutdown(false);
        let (record, accumulated) = self.tasks.remove(task_id)?;
        info!(task_id = %task_id, "Finish task");

        let stats = assemble_stats(
            accumulated,
            &record.practitioner_ids,
            record.config.worker_number,
        )?;
        Ok(Some(stats))
    }
}

/// Submit the server, then every worker batch
fn launch(
    context: &ExecutionContext,
    server: ServerConfig,
    workers: Vec<Vec<WorkerConfig>>,
) -> Result<()> {
    submit_server(context, server)?;
    for batch in workers {
        start_workers(context, batch)?;
    }
    Ok(())
}

/// Ids of the run's participants, one per worker slot
fn participant_ids(
    practitioners: &BTreeSet<Practitioner>,
    worker_number: usize,
) -> Result<BTreeSet<ParticipantId>> {
    if practitioners.len() != worker_number {
        return Err(Error::precondition(format!(
            "worker_number is {} but {} practitioners were given",
            worker_number,
            practitioners.len()
        )));
    }
    Ok(practitioners.iter().map(|p| p.id.clone()).collect())
}
