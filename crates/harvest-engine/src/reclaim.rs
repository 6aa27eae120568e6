//! Stale-claim reclaimer
//!
//! A worker that dies mid-batch leaves its items `in_progress` forever. The
//! reclaimer periodically returns claims older than the stale threshold to
//! `pending`. Live workers keep their claims fresh with heartbeats.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineResult;
use crate::queue::WorkQueue;

/// Reset in-progress items claimed longer ago than `threshold`.
pub async fn reclaim_stale(
    queue: &WorkQueue,
    run_id: &str,
    threshold: Duration,
) -> EngineResult<u64> {
    let reclaimed = queue.reset_in_progress(run_id, Some(threshold)).await?;

    if reclaimed > 0 {
        tracing::warn!(
            run_id = %run_id,
            reclaimed,
            threshold_secs = threshold.as_secs(),
            "Reclaimed stale claims"
        );
    }

    Ok(reclaimed)
}

/// Reset every in-progress item of the run. Only safe when no other process
/// works on the run, i.e. right after resuming it.
pub async fn reset_all_in_progress(queue: &WorkQueue, run_id: &str) -> EngineResult<u64> {
    let reset = queue.reset_in_progress(run_id, None).await?;

    if reset > 0 {
        tracing::info!(run_id = %run_id, reset, "Reset in-progress items left by previous process");
    }

    Ok(reset)
}

/// Background sweep task
#[derive(Debug, Clone)]
pub struct StaleClaimReclaimer {
    queue: WorkQueue,
    run_id: String,
    threshold: Duration,
    interval: Duration,
}

impl StaleClaimReclaimer {
    pub fn new(queue: WorkQueue, run_id: impl Into<String>, threshold: Duration, interval: Duration) -> Self {
        Self {
            queue,
            run_id: run_id.into(),
            threshold,
            interval,
        }
    }

    /// One sweep; errors are logged and reported as zero.
    pub async fn sweep(&self) -> u64 {
        match reclaim_stale(&self.queue, &self.run_id, self.threshold).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %e, "Stale-claim sweep failed");
                0
            },
        }
    }

    /// Sweep every `interval` until `cancel` fires. Returns the total reclaimed.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // Skip first immediate tick

            let mut total = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        total += self.sweep().await;
                    }
                }
            }

            tracing::debug!(run_id = %self.run_id, total, "Stale-claim reclaimer stopped");
            total
        })
    }
}
