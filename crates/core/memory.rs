//! In-memory storage for single-process use and tests.
//!
//! State lives behind one mutex; blocked dequeuers park on a [`Notify`].
//! Nothing survives the process.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, TqError};
use crate::job::{Job, JobId, JobStatus};
use crate::storage::{DeadLetter, Storage};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// Claim order. May hold ids that have since left PENDING; claim skips them.
    queue: VecDeque<JobId>,
    dead: Vec<DeadLetter>,
}

/// FIFO storage held entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Pop the next PENDING job and claim it.
    fn try_claim(&self) -> Option<Job> {
        let mut state = self.lock();
        while let Some(id) = state.queue.pop_front() {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.heartbeat_at = Some(Utc::now());
            return Some(job.clone());
        }
        None
    }

    fn update<F>(&self, id: &JobId, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job),
    {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| TqError::JobNotFound(id.to_string()))?;
        f(job);
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn enqueue(&self, mut job: Job) -> Result<()> {
        job.status = JobStatus::Pending;
        job.heartbeat_at = None;
        let id = job.id;
        {
            let mut state = self.lock();
            let already_queued = state
                .jobs
                .get(&id)
                .is_some_and(|existing| existing.status == JobStatus::Pending);
            state.jobs.insert(id, job);
            if !already_queued {
                state.queue.push_back(id);
            }
        }
        self.notify.notify_one();
        tracing::debug!(job_id = %id, "Job enqueued");
        Ok(())
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Job>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before checking so an enqueue in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_claim() {
                tracing::debug!(job_id = %job.id, attempt = job.attempts, "Job claimed");
                return Ok(Some(job));
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(self.try_claim());
                    }
                }
            }
        }
    }

    async fn size(&self) -> Result<usize> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count())
    }

    async fn mark_done(&self, job: &Job) -> Result<()> {
        self.update(&job.id, |stored| {
            stored.status = JobStatus::Success;
            stored.error = None;
        })
    }

    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()> {
        self.update(&job.id, |stored| {
            stored.status = JobStatus::Failed;
            stored.error = Some(error.to_string());
        })
    }

    async fn reap_stale(&self, visibility_timeout: Duration) -> Result<usize> {
        let Ok(threshold) = TimeDelta::from_std(visibility_timeout) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - threshold;

        let reaped = {
            let mut state = self.lock();
            let stale: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| {
                    job.status == JobStatus::Running
                        && job.heartbeat_at.map_or(true, |beat| beat <= cutoff)
                })
                .map(|job| job.id)
                .collect();

            for id in &stale {
                if let Some(job) = state.jobs.get_mut(id) {
                    job.status = JobStatus::Pending;
                }
                state.queue.push_back(*id);
            }
            stale.len()
        };

        for _ in 0..reaped {
            self.notify.notify_one();
        }
        Ok(reaped)
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()> {
        self.lock().dead.push(DeadLetter {
            job: job.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self.lock().dead.iter().take(limit).cloned().collect())
    }

    async fn dead_len(&self) -> Result<usize> {
        Ok(self.lock().dead.len())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(id).cloned())
    }
}
