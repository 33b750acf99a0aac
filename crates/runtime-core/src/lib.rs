//! Runtime Core - Foundation for the federated simulation runtime
//!
//! Provides core types, error handling, configuration, and the executor
//! pool that runs the server and worker units of a training run.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod types;

pub use config::{ExecutorConfig, TrainingConfig};
pub use context::ExecutionContext;
pub use error::{Error, Result};
pub use executor::{ExecutorPool, ExecutorPoolBuilder, Job, JobOutcome, JobSlot, PoolPoll};
pub use types::*;
