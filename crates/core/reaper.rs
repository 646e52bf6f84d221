//! Reaper component for stale claim recovery.
//!
//! The reaper periodically asks the storage to return RUNNING jobs whose
//! heartbeat is older than the visibility timeout to PENDING, so jobs held by
//! a crashed or hung worker become claimable again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::Result;
use crate::storage::Storage;

/// Reaper that recovers stale claims.
pub struct Reaper<S: Storage> {
    storage: S,
    interval: Duration,
    visibility_timeout: Duration,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl<S: Storage> Reaper<S> {
    /// Create a new reaper.
    ///
    /// The loop exits once `running` is false; notifying `wake` makes it
    /// notice without waiting out the current interval.
    pub fn new(
        storage: S,
        interval: Duration,
        visibility_timeout: Duration,
        running: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            storage,
            interval,
            visibility_timeout,
            running,
            wake,
        }
    }

    /// Run the reaper loop.
    pub async fn run(&self) {
        tracing::debug!(
            visibility_timeout_ms = self.visibility_timeout.as_millis() as u64,
            "Reaper started"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "Failed to reap stale jobs");
            }
        }

        tracing::debug!("Reaper stopped");
    }

    /// Run one reap pass and return how many jobs moved back to PENDING.
    pub async fn tick(&self) -> Result<usize> {
        let reaped = self.storage.reap_stale(self.visibility_timeout).await?;
        if reaped > 0 {
            tracing::info!(count = reaped, "Reaped stale jobs");
        } else {
            tracing::trace!("No stale jobs");
        }
        Ok(reaped)
    }
}
