//! Storage abstraction for job queue state.
//!
//! This module provides the trait every backend implements (in-memory and
//! SQLite). A storage owns the authoritative record of each job it holds;
//! callers only ever receive copies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::job::{Job, JobId};

/// An entry in the dead-letter log.
///
/// Entries are immutable snapshots and stay valid after the live job record
/// changes or disappears.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The job as it was when dead-lettered.
    pub job: Job,
    /// Description of the final failure.
    pub error: String,
    /// When the entry was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Storage trait for job queue operations.
///
/// Implementations must be thread-safe (Send + Sync) and must serialize
/// conflicting mutations so that claim, heartbeat update and terminal
/// transitions are each atomic with respect to concurrent callers.
#[async_trait]
pub trait Storage: Send + Sync {
    // ========== Queue Operations ==========

    /// Insert or overwrite the job (same id) as PENDING and wake a blocked dequeuer.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Claim the oldest PENDING job.
    ///
    /// Blocks until a job is available or `timeout` elapses (`None` waits
    /// forever). The claimed job is RUNNING with `attempts` incremented and a
    /// fresh heartbeat. At most one concurrent caller wins a given job.
    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Job>>;

    /// Number of PENDING jobs.
    async fn size(&self) -> Result<usize>;

    // ========== Outcome Operations ==========

    /// Transition the job to SUCCESS and clear any stored error.
    async fn mark_done(&self, job: &Job) -> Result<()>;

    /// Transition the job to FAILED and record `error`.
    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()>;

    // ========== Recovery ==========

    /// Return RUNNING jobs whose heartbeat is at least `visibility_timeout` old
    /// to PENDING, leaving `attempts` untouched. Returns how many moved.
    async fn reap_stale(&self, visibility_timeout: Duration) -> Result<usize>;

    // ========== Dead Letter Queue ==========

    /// Append an immutable record of `job` and `error` to the dead-letter log.
    ///
    /// Does not change the job's status.
    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()>;

    /// Dead-letter entries, oldest first, at most `limit`.
    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Number of dead-letter entries.
    async fn dead_len(&self) -> Result<usize>;

    // ========== Inspection ==========

    /// A copy of the authoritative record for `id`.
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;
}

/// A type-erased storage that can be shared across tasks.
pub type DynStorage = Arc<dyn Storage>;

/// Wrapper around Arc<dyn Storage> for convenience.
#[derive(Clone)]
pub struct SharedStorage {
    inner: DynStorage,
}

impl SharedStorage {
    /// Create a new SharedStorage from any Storage implementation.
    pub fn new<S: Storage + 'static>(storage: S) -> Self {
        Self {
            inner: Arc::new(storage),
        }
    }

    /// Get a reference to the inner storage.
    pub fn inner(&self) -> &DynStorage {
        &self.inner
    }
}

impl From<DynStorage> for SharedStorage {
    fn from(inner: DynStorage) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Storage for SharedStorage {
    async fn enqueue(&self, job: Job) -> Result<()> {
        self.inner.enqueue(job).await
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Job>> {
        self.inner.dequeue(timeout).await
    }

    async fn size(&self) -> Result<usize> {
        self.inner.size().await
    }

    async fn mark_done(&self, job: &Job) -> Result<()> {
        self.inner.mark_done(job).await
    }

    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()> {
        self.inner.mark_failed(job, error).await
    }

    async fn reap_stale(&self, visibility_timeout: Duration) -> Result<usize> {
        self.inner.reap_stale(visibility_timeout).await
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()> {
        self.inner.dead_letter(job, error).await
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.inner.list_dead(limit).await
    }

    async fn dead_len(&self) -> Result<usize> {
        self.inner.dead_len().await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.inner.get(id).await
    }
}
