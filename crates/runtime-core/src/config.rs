//! Training run configuration types

use crate::{Error, Result, SessionId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Configuration of one training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Name of the federated algorithm to run
    pub algorithm: String,

    /// Number of worker slots in the run
    pub worker_number: usize,

    /// Number of training rounds
    pub round: u64,

    /// Dataset the workers train on
    pub dataset_name: String,

    /// Model the workers train
    pub model_name: String,

    /// Root directory for session output
    pub save_dir: PathBuf,

    /// Current session identifier, minted by `reset_session`
    pub session_id: Option<SessionId>,

    /// Current session directory, derived by `reset_session`
    pub session_dir: Option<PathBuf>,

    /// Process environment installed by `apply_global_config`
    pub environment: BTreeMap<String, String>,

    /// Algorithm specific settings, opaque to the orchestrator
    pub algorithm_kwargs: serde_json::Value,

    /// Executor settings
    pub executor: ExecutorConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            algorithm: "fed_avg".to_string(),
            worker_number: 1,
            round: 1,
            dataset_name: String::new(),
            model_name: String::new(),
            save_dir: PathBuf::from("./session"),
            session_id: None,
            session_dir: None,
            environment: default_environment(),
            algorithm_kwargs: serde_json::Value::Null,
            executor: ExecutorConfig::default(),
        }
    }
}

/// Environment variables that keep memory usage down in large simulations
fn default_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("CUDA_MODULE_LOADING".to_string(), "LAZY".to_string()),
        ("USE_THREAD_DATALOADER".to_string(), "1".to_string()),
    ])
}

impl TrainingConfig {
    /// Create a config for the given algorithm and worker count
    pub fn new(algorithm: impl Into<String>, worker_number: usize) -> Self {
        Self {
            algorithm: algorithm.into(),
            worker_number,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: TrainingConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the config for values no run can use
    pub fn validate(&self) -> Result<()> {
        if self.algorithm.is_empty() {
            return Err(Error::InvalidConfig {
                message: "algorithm must not be empty".to_string(),
            });
        }
        if self.worker_number == 0 {
            return Err(Error::InvalidConfig {
                message: "worker_number must be at least 1".to_string(),
            });
        }
        self.executor.validate()
    }

    /// Drop all state of a previous session and start a fresh one
    pub fn reset_session(&mut self) {
        let session_id = Uuid::new_v4().to_string();
        let stamp = Utc::now().format("%Y-%m-%d_%H_%M_%S");
        self.session_dir = Some(
            self.save_dir
                .join(&self.algorithm)
                .join(format!("{stamp}_{session_id}")),
        );
        self.session_id = Some(session_id);
    }

    /// Install process wide settings required by the run
    pub fn apply_global_config(&self) -> Result<()> {
        for (key, value) in &self.environment {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(Error::InvalidConfig {
                    message: format!("invalid environment variable: {key:?}"),
                });
            }
            std::env::set_var(key, value);
            debug!(key = %key, value = %value, "Set environment variable");
        }
        Ok(())
    }

    /// Directory holding this session's output
    pub fn session_dir(&self) -> PathBuf {
        self.session_dir
            .clone()
            .unwrap_or_else(|| self.save_dir.join(&self.algorithm))
    }

    /// Log file of this session
    pub fn log_file(&self) -> PathBuf {
        self.session_dir().join("training.log")
    }
}

/// Executor pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of async runtime threads
    pub worker_threads: usize,

    /// Upper bound on threads running server and worker units
    pub max_blocking_threads: usize,

    /// Number of workers launched together in one batch
    pub workers_per_batch: usize,

    /// How long a draining shutdown may take
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Thread name prefix
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 512,
            workers_per_batch: 8,
            shutdown_timeout: Duration::from_secs(5),
            thread_name: "fedsim-executor".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 || self.max_blocking_threads == 0 {
            return Err(Error::InvalidConfig {
                message: "executor thread counts must be at least 1".to_string(),
            });
        }
        if self.workers_per_batch == 0 {
            return Err(Error::InvalidConfig {
                message: "workers_per_batch must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
