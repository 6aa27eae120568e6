//! Run status watcher
//!
//! `harvest stop` and `harvest cancel` only flip the ledger row. The process
//! working the run polls that row and cancels its own workers once the run is
//! no longer resumable, so they release their unstarted claims and exit.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ledger::LedgerStore;
use crate::types::RunStatus;

/// What one poll of the ledger row found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Still `running` or `resume`
    Open,
    /// Closed by someone else
    Closed(RunStatus),
    /// The row no longer exists
    Missing,
}

#[derive(Debug, Clone)]
pub struct RunStatusWatcher {
    ledger: LedgerStore,
    run_id: String,
    interval: Duration,
}

impl RunStatusWatcher {
    pub fn new(ledger: LedgerStore, run_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            ledger,
            run_id: run_id.into(),
            interval,
        }
    }

    /// Read the ledger row once. A failed read counts as `Open`; the next
    /// poll tries again.
    pub async fn check(&self) -> RunState {
        match self.ledger.get(&self.run_id).await {
            Ok(Some(run)) if run.status.is_resumable() => RunState::Open,
            Ok(Some(run)) => RunState::Closed(run.status),
            Ok(None) => RunState::Missing,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "Run status poll failed");
                RunState::Open
            },
        }
    }

    /// Poll every `interval`. Cancels `stop` when the run is closed or gone,
    /// and ends when `done` fires. Returns the status that closed the run.
    pub fn spawn(self, stop: CancellationToken, done: CancellationToken) -> JoinHandle<Option<RunStatus>> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // Skip first immediate tick

            let closed_by = loop {
                tokio::select! {
                    _ = done.cancelled() => break None,
                    _ = interval.tick() => {
                        match self.check().await {
                            RunState::Open => {},
                            RunState::Closed(status) => {
                                tracing::warn!(run_id = %self.run_id, status = %status, "Run closed externally, stopping workers");
                                stop.cancel();
                                break Some(status);
                            },
                            RunState::Missing => {
                                tracing::error!(run_id = %self.run_id, "Run vanished from the ledger, stopping workers");
                                stop.cancel();
                                break None;
                            },
                        }
                    }
                }
            };

            tracing::debug!(run_id = %self.run_id, "Run status watcher stopped");
            closed_by
        })
    }
}
