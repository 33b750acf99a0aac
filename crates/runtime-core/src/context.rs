//! Execution context shared by all units of one run

use crate::config::ExecutorConfig;
use crate::executor::{ExecutorPool, Job, JobSlot};
use crate::{Result, TaskId};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Handle to the execution fabric of a single run
///
/// Cloning is cheap and every clone refers to the same pool. All jobs
/// submitted through a context belong to one logical run.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: Uuid,
    task_id: Option<TaskId>,
    pool: Arc<ExecutorPool>,
}

impl ExecutionContext {
    /// Create a context over an existing pool
    pub fn new(pool: Arc<ExecutorPool>, task_id: Option<TaskId>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                task_id,
                pool,
            }),
        }
    }

    /// Create a context with a fresh pool
    pub fn from_config(config: &ExecutorConfig, task_id: Option<TaskId>) -> Result<Self> {
        let pool = ExecutorPool::new(config.clone())?;
        Ok(Self::new(Arc::new(pool), task_id))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Task this context runs for, `None` in synchronous mode
    pub fn task_id(&self) -> Option<TaskId> {
        self.inner.task_id
    }

    pub fn executor_pool(&self) -> Arc<ExecutorPool> {
        Arc::clone(&self.inner.pool)
    }

    /// Schedule a batch of jobs without waiting for them
    pub fn submit<I>(&self, jobs: I) -> Result<Vec<JobSlot>>
    where
        I: IntoIterator<Item = Job>,
    {
        let slots = jobs
            .into_iter()
            .map(|job| self.inner.pool.submit(job))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            context_id = %self.inner.id,
            jobs = slots.len(),
            "Submitted batch"
        );
        Ok(slots)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("task_id", &self.inner.task_id)
            .field("submitted", &self.inner.pool.submitted())
            .finish()
    }
}
