//! Error types for the simulation runtime

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the simulation runtime
#[derive(Error, Debug)]
pub enum Error {
    // Task errors
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Task already registered: {task_id}")]
    TaskAlreadyRegistered { task_id: String },

    // Precondition errors
    #[error("Precondition failed: {message}")]
    Precondition { message: String },

    #[error("Unknown algorithm: {name}")]
    UnknownAlgorithm { name: String },

    #[error(
        "Attribution table mismatch: worker_number={worker_number}, participants={participants}"
    )]
    AttributionMismatch {
        worker_number: usize,
        participants: usize,
    },

    #[error("Worker slot {slot} missing from attribution round {round}")]
    MissingWorkerSlot { round: u64, slot: usize },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Execution errors
    #[error("Runner failed: {unit} - {message}")]
    RunnerFailed { unit: String, message: String },

    #[error("Executor pool has been shut down")]
    ExecutorShutdown,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is a programmer error that no retry can fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Precondition { .. }
                | Error::InvalidConfig { .. }
                | Error::UnknownAlgorithm { .. }
                | Error::AttributionMismatch { .. }
                | Error::MissingWorkerSlot { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns true if this error is a failed task lookup
    pub fn is_lookup(&self) -> bool {
        matches!(self, Error::TaskNotFound { .. })
    }

    /// Shorthand for a precondition failure
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
