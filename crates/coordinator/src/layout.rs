//! Worker layout derivation
//!
//! Turns a training config (and optionally the practitioners of a task)
//! into the context, server and worker batches of a run.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use runtime_core::{
    Error, ExecutionContext, Practitioner, Result, TaskId, TrainingConfig, WorkerSlot,
};
use tracing::{debug, info};

use crate::runner::{ServerConfig, ServerConstructor, WorkerConfig, WorkerConstructor};

/// Everything needed to launch one run
#[derive(Debug)]
pub struct WorkerLayout {
    /// Context all units of the run are submitted to
    pub context: ExecutionContext,

    /// Server of the run
    pub server: Option<ServerConfig>,

    /// Worker batches, each launched as one submission
    pub workers: Vec<Vec<WorkerConfig>>,
}

impl WorkerLayout {
    /// Total number of workers over all batches
    pub fn worker_count(&self) -> usize {
        self.workers.iter().map(Vec::len).sum()
    }
}

/// Derives the layout of a run
pub trait WorkerConfigFactory: Send + Sync {
    fn worker_config(
        &self,
        config: &TrainingConfig,
        task_id: Option<TaskId>,
        practitioners: Option<&BTreeSet<Practitioner>>,
    ) -> Result<WorkerLayout>;
}

/// Builds the server constructor of an algorithm
pub type ServerBuilder = Arc<dyn Fn(&TrainingConfig) -> ServerConstructor + Send + Sync>;

/// Builds the worker constructor for one slot of an algorithm
pub type WorkerBuilder = Arc<
    dyn Fn(&TrainingConfig, WorkerSlot, Option<&Practitioner>) -> WorkerConstructor + Send + Sync,
>;

struct AlgorithmEntry {
    server: ServerBuilder,
    worker: WorkerBuilder,
}

/// Layout factory backed by a table of named algorithms
#[derive(Default)]
pub struct AlgorithmRegistry {
    algorithms: DashMap<String, AlgorithmEntry>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an algorithm, replacing any previous one with the same name
    pub fn register<S, W>(&self, name: impl Into<String>, server: S, worker: W)
    where
        S: Fn(&TrainingConfig) -> ServerConstructor + Send + Sync + 'static,
        W: Fn(&TrainingConfig, WorkerSlot, Option<&Practitioner>) -> WorkerConstructor
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        info!(algorithm = %name, "Algorithm registered");
        self.algorithms.insert(
            name,
            AlgorithmEntry {
                server: Arc::new(server),
                worker: Arc::new(worker),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.algorithms.contains_key(name)
    }

    /// Names of all registered algorithms, sorted
    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .algorithms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl WorkerConfigFactory for AlgorithmRegistry {
    fn worker_config(
        &self,
        config: &TrainingConfig,
        task_id: Option<TaskId>,
        practitioners: Option<&BTreeSet<Practitioner>>,
    ) -> Result<WorkerLayout> {
        config.validate()?;

        let (server_builder, worker_builder) = {
            let entry = self
                .algorithms
                .get(&config.algorithm)
                .ok_or_else(|| Error::UnknownAlgorithm {
                    name: config.algorithm.clone(),
                })?;
            (Arc::clone(&entry.server), Arc::clone(&entry.worker))
        };

        let assigned: Option<Vec<&Practitioner>> = practitioners.map(|p| p.iter().collect());
        if let Some(assigned) = &assigned {
            if assigned.len() != config.worker_number {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "worker_number is {} but {} practitioners were given",
                        config.worker_number,
                        assigned.len()
                    ),
                });
            }
        }

        let context = ExecutionContext::from_config(&config.executor, task_id)?;
        let server = ServerConfig::new(server_builder(config));

        let slots: Vec<WorkerConfig> = (0..config.worker_number)
            .map(|slot| {
                let practitioner = assigned.as_ref().map(|a| a[slot]);
                let worker = WorkerConfig::new(slot, worker_builder(config, slot, practitioner));
                match practitioner {
                    Some(p) => worker.with_practitioner(p.id.clone()),
                    None => worker,
                }
            })
            .collect();

        let workers: Vec<Vec<WorkerConfig>> = slots
            .chunks(config.executor.workers_per_batch)
            .map(<[WorkerConfig]>::to_vec)
            .collect();

        debug!(
            algorithm = %config.algorithm,
            worker_count = config.worker_number,
            batches = workers.len(),
            "Derived worker layout"
        );

        Ok(WorkerLayout {
            context,
            server: Some(server),
            workers,
        })
    }
}
