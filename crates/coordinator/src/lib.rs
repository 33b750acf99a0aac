//! Coordinator for federated training simulations
//!
//! This crate launches and tracks training runs:
//! - **Runners**: Server and worker units submitted to a shared execution context
//! - **Layouts**: Deriving the server and worker batches of a run from its config
//! - **Task registry**: Bookkeeping of asynchronous runs by task id
//! - **Attribution**: Remapping per-slot shapley values to participant ids
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use coordinator::{AlgorithmRegistry, Orchestrator};
//! use runtime_core::{Practitioner, TrainingConfig};
//!
//! let algorithms = Arc::new(AlgorithmRegistry::new());
//! // algorithms.register("fed_avg", build_server, build_worker);
//! let orchestrator = Orchestrator::new(algorithms);
//!
//! let practitioners = ["p1", "p2"].into_iter().map(Practitioner::new).collect();
//! let config = TrainingConfig::new("fed_avg", 2);
//! let task_id = orchestrator.train(&config, Some(&practitioners))?.unwrap();
//!
//! while orchestrator.get_training_result(task_id, Some(poll_interval))?.is_none() {}
//! ```

pub mod attribution;
pub mod layout;
pub mod orchestrator;
pub mod registry;
pub mod runner;

// Re-export main types
pub use attribution::{assemble_stats, remap_shapley_values};
pub use layout::{AlgorithmRegistry, ServerBuilder, WorkerBuilder, WorkerConfigFactory, WorkerLayout};
pub use orchestrator::Orchestrator;
pub use registry::{TaskRecord, TaskRegistry, TaskSummary};
pub use runner::{
    run_worker, start_server, start_workers, submit_server, Server, ServerConfig,
    ServerConstructor, ServerReport, Worker, WorkerConfig, WorkerConstructor,
};

// Re-export runtime-core types used in the public API
pub use runtime_core::{Error, Result};
