//! Executor pool running server and worker units of a training run

use crate::config::ExecutorConfig;
use crate::{Error, ResultFragment, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Position of a submitted job within its pool
pub type JobSlot = usize;

/// What a finished job produced
pub type JobOutcome = Result<Option<ResultFragment>>;

type JobFn = Box<dyn FnOnce() -> JobOutcome + Send + 'static>;

/// A named unit of blocking work
pub struct Job {
    name: String,
    run: JobFn,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> JobOutcome + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
struct PendingJob {
    slot: JobSlot,
    name: String,
    handle: JoinHandle<JobOutcome>,
}

/// Result of polling a pool
#[derive(Debug, Default)]
pub struct PoolPoll {
    /// Jobs that finished since the previous poll
    pub completed: BTreeMap<JobSlot, JobOutcome>,

    /// Jobs still running
    pub pending: BTreeSet<JobSlot>,
}

impl PoolPoll {
    /// Returns true if no job is left running
    pub fn is_done(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Pool of threads running the blocking units of one run
#[derive(Debug)]
pub struct ExecutorPool {
    /// Tokio runtime, `None` once shut down
    runtime: Mutex<Option<Runtime>>,

    /// Jobs not yet reported by `wait_results`
    jobs: Mutex<Vec<PendingJob>>,

    /// Jobs taken out of `jobs` by a poll in progress
    polling: AtomicUsize,

    /// Next slot to hand out
    next_slot: AtomicUsize,

    /// Configuration
    config: ExecutorConfig,
}

impl ExecutorPool {
    /// Create a new executor pool
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .max_blocking_threads(config.max_blocking_threads)
            .enable_all()
            .thread_name(config.thread_name.clone())
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            jobs: Mutex::new(Vec::new()),
            polling: AtomicUsize::new(0),
            next_slot: AtomicUsize::new(0),
            config,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Returns true once `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }

    /// Number of jobs submitted so far
    pub fn submitted(&self) -> usize {
        self.next_slot.load(Ordering::SeqCst)
    }

    /// Number of jobs not yet reported as finished
    pub fn outstanding(&self) -> usize {
        let jobs = self.jobs.lock();
        jobs.len() + self.polling.load(Ordering::SeqCst)
    }

    fn handle(&self) -> Result<Handle> {
        self.runtime
            .lock()
            .as_ref()
            .map(|rt| rt.handle().clone())
            .ok_or(Error::ExecutorShutdown)
    }

    /// Schedule a job and return immediately
    pub fn submit(&self, job: Job) -> Result<JobSlot> {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or(Error::ExecutorShutdown)?;

        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let Job { name, run } = job;
        let handle = runtime.spawn_blocking(run);
        debug!(slot = slot, job = %name, "Job submitted");

        self.jobs.lock().push(PendingJob { slot, name, handle });
        Ok(slot)
    }

    /// Collect finished jobs
    ///
    /// `None` blocks until every outstanding job is done. `Some(timeout)`
    /// returns whatever finished within the bound. A finished job is reported
    /// exactly once. A timeout too large to represent waits like `None`.
    ///
    /// Fails with `Error::Precondition` when called from within a tokio
    /// runtime, leaving every job in place.
    pub fn wait_results(&self, timeout: Option<Duration>) -> Result<PoolPoll> {
        if Handle::try_current().is_ok() {
            return Err(Error::precondition(
                "wait_results must not be called from within a tokio runtime",
            ));
        }
        let handle = self.handle()?;
        let deadline = timeout.and_then(|t| tokio::time::Instant::now().checked_add(t));

        let jobs = {
            let mut jobs = self.jobs.lock();
            self.polling.fetch_add(jobs.len(), Ordering::SeqCst);
            std::mem::take(&mut *jobs)
        };
        let taken = jobs.len();

        let (completed, unfinished) = handle.block_on(async move {
            let mut completed = BTreeMap::new();
            let mut unfinished = Vec::new();

            for mut job in jobs {
                let joined = match deadline {
                    _ if job.handle.is_finished() => Some((&mut job.handle).await),
                    None => Some((&mut job.handle).await),
                    Some(deadline) => tokio::time::timeout_at(deadline, &mut job.handle)
                        .await
                        .ok(),
                };

                match joined {
                    Some(joined) => {
                        completed.insert(job.slot, flatten_outcome(&job.name, joined));
                    }
                    None => unfinished.push(job),
                }
            }

            (completed, unfinished)
        });

        let mut jobs = self.jobs.lock();
        jobs.extend(unfinished);
        self.polling.fetch_sub(taken, Ordering::SeqCst);
        let pending = jobs.iter().map(|job| job.slot).collect();

        Ok(PoolPoll { completed, pending })
    }

    /// Shut the pool down
    ///
    /// With `wait` the call drains every outstanding job first, otherwise
    /// the runtime is released in the background.
    pub fn shutdown(&self, wait: bool) {
        if wait && !self.is_shutdown() {
            match self.wait_results(None) {
                Ok(poll) => {
                    for (slot, outcome) in poll.completed {
                        if let Err(e) = outcome {
                            warn!(slot = slot, error = %e, "Job failed during shutdown");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to drain executor pool"),
            }
        }

        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        if wait {
            runtime.shutdown_timeout(self.config.shutdown_timeout);
        } else {
            runtime.shutdown_background();
        }
        info!(
            submitted = self.submitted(),
            wait = wait,
            "Executor pool shut down"
        );
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

fn flatten_outcome(name: &str, joined: std::result::Result<JobOutcome, JoinError>) -> JobOutcome {
    match joined {
        Ok(Ok(fragment)) => Ok(fragment),
        Ok(Err(e)) => {
            warn!(job = %name, error = %e, "Job returned an error");
            Err(e)
        }
        Err(e) => {
            let message = if e.is_panic() {
                panic_message(e.into_panic())
            } else {
                e.to_string()
            };
            warn!(job = %name, message = %message, "Job aborted");
            Err(Error::RunnerFailed {
                unit: name.to_string(),
                message,
            })
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

/// Builder for ExecutorPool
pub struct ExecutorPoolBuilder {
    config: ExecutorConfig,
}

impl ExecutorPoolBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set async runtime thread count
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Set the blocking thread limit
    pub fn max_blocking_threads(mut self, threads: usize) -> Self {
        self.config.max_blocking_threads = threads;
        self
    }

    /// Set how long a draining shutdown may take
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the executor pool
    pub fn build(self) -> Result<ExecutorPool> {
        ExecutorPool::new(self.config)
    }
}

impl Default for ExecutorPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
