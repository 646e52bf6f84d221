//! Configuration types for the worker.

use std::time::Duration;

use crate::error::{Result, TqError};
use crate::retry::RetryPolicy;

/// Configuration for a Worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier attached to the worker's log events.
    pub worker_id: String,
    /// How long each dequeue call waits for a job.
    pub poll_timeout: Duration,
    /// Heartbeat age after which a RUNNING job is reaped. `None` disables reaping.
    pub visibility_timeout: Option<Duration>,
    /// Interval between reap passes.
    pub reap_interval: Duration,
    /// Per-job execution budget. `None` waits for the handler indefinitely.
    pub task_timeout: Option<Duration>,
    /// Retry and backoff policy.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            poll_timeout: Duration::from_millis(500),
            visibility_timeout: None,
            reap_interval: Duration::from_secs(1),
            task_timeout: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_timeout.is_zero() {
            return Err(TqError::Config("poll_timeout must be positive".to_string()));
        }
        if self.reap_interval.is_zero() {
            return Err(TqError::Config("reap_interval must be positive".to_string()));
        }
        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return Err(TqError::Config("task_timeout must be positive".to_string()));
        }
        self.retry.validate()
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker id used in logs.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Set the dequeue wait granularity.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    /// Enable reaping of claims older than `timeout`.
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.config.visibility_timeout = Some(timeout);
        self
    }

    /// Set the interval between reap passes.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    /// Bound each handler execution to `timeout`.
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Generate a short worker id.
pub fn generate_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}
