//! Worker for claiming and executing jobs.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::WorkerConfig;
use crate::error::{Result, TaskResult, TqError};
use crate::job::{Job, JobStatus};
use crate::reaper::Reaper;
use crate::registry::{panic_message, TaskArgs, TaskRegistry};
use crate::retrier::requeue_after;
use crate::storage::{SharedStorage, Storage};

/// Counters for a worker's outcomes.
#[derive(Debug, Default)]
struct WorkerMetrics {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Tasks a worker leaves running beside its poll loop.
///
/// Handles are plain [`JoinHandle`]s: dropping the last worker clone detaches
/// them, so a pending retry timer still re-enqueues its job.
#[derive(Debug, Default)]
struct Background {
    /// Retry timers and bounded-task runners.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Background {
    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reaper(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reaper.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.tasks().push(handle);
    }

    /// Drop bookkeeping for tasks that already finished.
    fn collect_finished(&self) {
        let finished: Vec<_> = {
            let mut tasks = self.tasks();
            let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *tasks)
                .into_iter()
                .partition(|handle| handle.is_finished());
            *tasks = pending;
            done
        };
        for handle in finished {
            if let Some(result) = handle.now_or_never() {
                log_join_result(result);
            }
        }
    }
}

/// A point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Jobs that finished an execution attempt, successfully or not.
    pub processed: u64,
    /// Jobs marked SUCCESS.
    pub succeeded: u64,
    /// Failures that were scheduled for another attempt.
    pub retried: u64,
    /// Failures that went to the dead-letter log.
    pub dead_lettered: u64,
}

/// Worker that polls a storage and runs registered handlers.
///
/// Clones share state: one clone can run [`run_forever`](Self::run_forever)
/// while another calls [`stop`](Self::stop) and [`join`](Self::join).
#[derive(Clone)]
pub struct Worker<S = SharedStorage>
where
    S: Storage + Clone + 'static,
{
    config: Arc<WorkerConfig>,
    storage: S,
    registry: TaskRegistry,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    metrics: Arc<WorkerMetrics>,
    background: Arc<Background>,
}

impl<S> Worker<S>
where
    S: Storage + Clone + 'static,
{
    /// Create a worker, rejecting invalid configuration.
    pub fn new(storage: S, registry: TaskRegistry, config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            storage,
            registry,
            running: Arc::new(AtomicBool::new(true)),
            wake: Arc::new(Notify::new()),
            metrics: Arc::new(WorkerMetrics::default()),
            background: Arc::new(Background::default()),
        })
    }

    /// The worker's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The storage this worker polls.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Poll for jobs until [`stop`](Self::stop) is called.
    ///
    /// Per-job failures never escape this loop; storage errors are logged and
    /// the loop backs off for one poll interval.
    pub async fn run_forever(&self) {
        let worker_id = self.config.worker_id.as_str();
        tracing::info!(worker_id, "Worker started");

        if let Some(visibility_timeout) = self.config.visibility_timeout {
            let reaper = Reaper::new(
                self.storage.clone(),
                self.config.reap_interval,
                visibility_timeout,
                self.running.clone(),
                self.wake.clone(),
            );
            let handle = tokio::spawn(async move { reaper.run().await });
            if let Some(previous) = self.background.reaper().replace(handle) {
                previous.abort();
            }
        }

        while self.running.load(Ordering::SeqCst) {
            match self.storage.dequeue(Some(self.config.poll_timeout)).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_timeout) => {}
                        _ = self.wake.notified() => {}
                    }
                }
            }
            self.background.collect_finished();
        }

        tracing::info!(worker_id, "Worker stopped");
    }

    /// Ask the loop to exit after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for retry timers and task runners to finish.
    ///
    /// Returns `true` if everything settled. Once the worker is stopped the
    /// reaper is waited for too. Nothing is aborted: a runner still executing
    /// an abandoned handler stays tracked and keeps running. The poll loop is
    /// never blocked while this waits.
    pub async fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = Vec::new();

        // Tasks spawned while waiting are picked up by the next round.
        loop {
            let handles = std::mem::take(&mut *self.background.tasks());
            if handles.is_empty() {
                break;
            }
            for mut handle in handles {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(result) => log_join_result(result),
                    Err(_) => remaining.push(handle),
                }
            }
            if !remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
        }

        let mut settled = remaining.is_empty();
        if !self.is_running() {
            let reaper = self.background.reaper().take();
            if let Some(mut handle) = reaper {
                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Ok(result) => log_join_result(result),
                    Err(_) => {
                        settled = false;
                        *self.background.reaper() = Some(handle);
                    }
                }
            }
        }

        if !settled {
            tracing::warn!(
                worker_id = %self.config.worker_id,
                remaining = remaining.len(),
                "Background tasks still running after join timeout"
            );
        }
        self.background.tasks().extend(remaining);
        settled
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.metrics.processed.load(Ordering::SeqCst),
            succeeded: self.metrics.succeeded.load(Ordering::SeqCst),
            retried: self.metrics.retried.load(Ordering::SeqCst),
            dead_lettered: self.metrics.dead_lettered.load(Ordering::SeqCst),
        }
    }

    async fn process(&self, job: Job) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            job_id = %job.id,
            func_name = %job.func_name,
            attempt = job.attempts,
            "Job started"
        );

        match self.execute(&job).await {
            Ok(output) => {
                self.metrics.processed.fetch_add(1, Ordering::SeqCst);
                self.metrics.succeeded.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = self.storage.mark_done(&job).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job done");
                }
                tracing::info!(
                    worker_id = %self.config.worker_id,
                    job_id = %job.id,
                    func_name = %job.func_name,
                    output = %output,
                    "Job succeeded"
                );
            }
            Err(err) => self.handle_failure(job, err).await,
        }
    }

    /// Resolve and run the handler, bounded by `task_timeout` when set.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value> {
        let task = self.registry.resolve(&job.func_name)?;
        let args = TaskArgs::new(job.args.clone(), job.kwargs.clone());
        // The call itself happens inside the future so a panicking handler is caught too.
        let run = AssertUnwindSafe(async move { task(args).await }).catch_unwind();

        let Some(limit) = self.config.task_timeout else {
            return into_outcome(run.await);
        };

        let (tx, rx) = oneshot::channel();
        self.background.spawn(async move {
            let _ = tx.send(run.await);
        });

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(outcome)) => into_outcome(outcome),
            Ok(Err(_)) => Err(TqError::Panicked("task runner dropped".to_string())),
            Err(_) => {
                tracing::warn!(
                    worker_id = %self.config.worker_id,
                    job_id = %job.id,
                    timeout_ms = limit.as_millis() as u64,
                    "Task timed out; abandoning runner"
                );
                Err(TqError::Timeout(limit))
            }
        }
    }

    async fn handle_failure(&self, mut job: Job, err: TqError) {
        let error = err.to_string();
        self.metrics.processed.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            worker_id = %self.config.worker_id,
            job_id = %job.id,
            func_name = %job.func_name,
            attempt = job.attempts,
            error = %error,
            "Job failed"
        );

        if let Err(e) = self.storage.mark_failed(&job, &error).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to mark job failed");
        }
        job.status = JobStatus::Failed;
        job.error = Some(error.clone());

        if !err.is_permanent() && self.config.retry.should_retry(job.attempts) {
            let delay = self.config.retry.compute_delay(job.attempts);
            self.metrics.retried.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                worker_id = %self.config.worker_id,
                job_id = %job.id,
                delay_ms = delay.as_millis() as u64,
                next_attempt = job.attempts + 1,
                "Job retry scheduled"
            );
            self.background
                .spawn(requeue_after(self.storage.clone(), job, delay));
        } else {
            self.metrics.dead_lettered.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.storage.dead_letter(&job, &error).await {
                tracing::error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
            }
            tracing::warn!(
                worker_id = %self.config.worker_id,
                job_id = %job.id,
                func_name = %job.func_name,
                attempt = job.attempts,
                "Job moved to dead-letter log"
            );
        }
    }

}

fn into_outcome(
    outcome: std::result::Result<TaskResult, Box<dyn std::any::Any + Send>>,
) -> Result<serde_json::Value> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(task_err)) => Err(TqError::Task(task_err)),
        Err(payload) => Err(TqError::Panicked(panic_message(payload))),
    }
}

fn log_join_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
}
