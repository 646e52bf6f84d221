//! Error types for the tq job queue library.

use std::time::Duration;

use thiserror::Error;

/// The main error type for the tq library.
#[derive(Error, Debug)]
pub enum TqError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No handler is registered under the job's function name.
    #[error("TaskNotFound: no task registered: {name:?} (known: {known:?})")]
    TaskNotFound { name: String, known: Vec<String> },

    /// The handler signalled a failure.
    #[error("{0}")]
    Task(TaskError),

    /// The handler did not finish within the worker's task timeout.
    #[error("TaskTimeout: task exceeded {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("TaskPanicked: {0}")]
    Panicked(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl TqError {
    /// Whether a job failing with this error must skip retries.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TqError::TaskNotFound { .. })
    }
}

/// Result type alias using TqError.
pub type Result<T> = std::result::Result<T, TqError>;

/// Result type for task handlers.
pub type TaskResult = std::result::Result<serde_json::Value, TaskError>;

/// Error returned from task handlers.
///
/// `kind` names the failure class and ends up at the front of the error text
/// recorded in storage and in the dead-letter log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    /// Short name of the error class, e.g. `ValueError` or `ParseIntError`.
    pub kind: String,
    /// Error message.
    pub message: String,
}

impl TaskError {
    /// Create a new task error.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create an error about a missing or mistyped argument.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::new("ArgumentError", message)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl<E: std::error::Error> From<E> for TaskError {
    fn from(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }
}

impl From<TaskError> for TqError {
    fn from(err: TaskError) -> Self {
        TqError::Task(err)
    }
}

/// Last path segment of a type name, without generic parameters.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
