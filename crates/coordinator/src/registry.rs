//! Task registry for asynchronous training runs

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use runtime_core::{
    Error, ExecutorPool, ParticipantId, Result, ResultFragment, TaskId, TrainingConfig,
};
use serde::Serialize;
use tracing::info;

/// Bookkeeping of one in-flight task
#[derive(Debug)]
pub struct TaskRecord {
    /// Pool running the units of the task
    pub pool: Arc<ExecutorPool>,

    /// Participants of the task
    pub practitioner_ids: BTreeSet<ParticipantId>,

    /// Config snapshot the task was launched with
    pub config: TrainingConfig,

    /// Registration timestamp
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        pool: Arc<ExecutorPool>,
        practitioner_ids: BTreeSet<ParticipantId>,
        config: TrainingConfig,
    ) -> Self {
        Self {
            pool,
            practitioner_ids,
            config,
            created_at: Utc::now(),
        }
    }
}

/// Read-only view of a registered task
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub algorithm: String,
    pub practitioners: usize,
    pub outstanding_jobs: usize,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe registry of in-flight tasks and their accumulated results
///
/// Per-key operations are atomic. Operations on the same task id from
/// several threads at once must be serialized by the caller.
#[derive(Default)]
pub struct TaskRegistry {
    /// Map of task ID to task record
    tasks: DashMap<TaskId, TaskRecord>,

    /// Map of task ID to the results merged so far
    task_results: DashMap<TaskId, ResultFragment>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task with an empty result accumulator
    pub fn register(&self, task_id: TaskId, record: TaskRecord) -> Result<()> {
        match self.tasks.entry(task_id) {
            Entry::Occupied(_) => Err(Error::TaskAlreadyRegistered {
                task_id: task_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                info!(
                    task_id = %task_id,
                    practitioners = record.practitioner_ids.len(),
                    algorithm = %record.config.algorithm,
                    "Task registered"
                );

                self.task_results.insert(task_id, ResultFragment::new());
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Get the pool of a task
    pub fn pool(&self, task_id: TaskId) -> Result<Arc<ExecutorPool>> {
        self.tasks
            .get(&task_id)
            .map(|record| Arc::clone(&record.pool))
            .ok_or_else(|| not_found(task_id))
    }

    /// Fold a result fragment into the task's accumulator
    pub fn merge_result(&self, task_id: TaskId, fragment: ResultFragment) -> Result<()> {
        let mut accumulated = self
            .task_results
            .get_mut(&task_id)
            .ok_or_else(|| not_found(task_id))?;
        accumulated.merge(fragment);
        Ok(())
    }

    /// Snapshot of the results accumulated so far
    pub fn accumulated(&self, task_id: TaskId) -> Option<ResultFragment> {
        self.task_results.get(&task_id).map(|r| r.clone())
    }

    /// Remove a task from both maps
    pub fn remove(&self, task_id: TaskId) -> Result<(TaskRecord, ResultFragment)> {
        let (_, record) = self
            .tasks
            .remove(&task_id)
            .ok_or_else(|| not_found(task_id))?;
        let results = self
            .task_results
            .remove(&task_id)
            .map(|(_, r)| r)
            .unwrap_or_default();

        info!(task_id = %task_id, "Task removed");
        Ok((record, results))
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Summaries of all registered tasks, oldest first
    pub fn summaries(&self) -> Vec<TaskSummary> {
        let mut summaries: Vec<TaskSummary> = self
            .tasks
            .iter()
            .map(|entry| {
                let record = entry.value();
                TaskSummary {
                    task_id: *entry.key(),
                    algorithm: record.config.algorithm.clone(),
                    practitioners: record.practitioner_ids.len(),
                    outstanding_jobs: record.pool.outstanding(),
                    created_at: record.created_at,
                }
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }
}

fn not_found(task_id: TaskId) -> Error {
    Error::TaskNotFound {
        task_id: task_id.to_string(),
    }
}
