//! Delayed re-enqueue of failed jobs.

use std::time::Duration;
use tokio::time;

use crate::job::{Job, JobStatus};
use crate::storage::Storage;

/// Wait `delay`, then put `job` back in `storage` as PENDING.
///
/// Runs as a background task owned by the worker, so the poll loop never
/// waits on a backoff. A failed re-enqueue is logged; the job then stays FAILED.
pub async fn requeue_after<S: Storage>(storage: S, mut job: Job, delay: Duration) {
    if !delay.is_zero() {
        time::sleep(delay).await;
    }

    job.status = JobStatus::Pending;
    let job_id = job.id;
    let attempt = job.attempts;

    match storage.enqueue(job).await {
        Ok(()) => {
            tracing::debug!(job_id = %job_id, next_attempt = attempt + 1, "Retry re-enqueued");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to re-enqueue retry");
        }
    }
}
