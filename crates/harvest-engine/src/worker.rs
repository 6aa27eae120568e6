//! Scrape worker
//!
//! Workers claim batches atomically, fetch each item through the source,
//! write results through the sink, and keep their claims alive with a
//! heartbeat while a batch is in flight.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DEFAULT_MAX_ATTEMPTS;
use crate::error::EngineResult;
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::sink::ResultSink;
use crate::source::ScrapeSource;
use crate::tables::ResultTable;
use crate::types::{ClaimedItem, Outcome, ResultRecord};

/// Longest `last_error` stored on a work item
pub const MAX_ERROR_LEN: usize = 2000;

/// `<hostname>:<pid>:<short-uuid>`
pub fn new_worker_id() -> String {
    let hostname = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}:{}:{}", hostname, std::process::id(), &suffix[..8])
}

/// Cut `message` to at most `max` bytes on a char boundary.
pub fn truncate_error(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut cut = max;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

/// Counters for one worker's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub batches: u64,
    pub claimed: u64,
    pub completed: u64,
    pub zero_result: u64,
    pub failed: u64,
    pub lost_claims: u64,
    pub released: u64,
    pub results_written: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &WorkerStats) {
        self.batches += other.batches;
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.zero_result += other.zero_result;
        self.failed += other.failed;
        self.lost_claims += other.lost_claims;
        self.released += other.released;
        self.results_written += other.results_written;
    }

    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed { result_count } => {
                self.completed += 1;
                self.results_written += *result_count as u64;
            },
            Outcome::ZeroResult => self.zero_result += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Worker for one run
pub struct ScrapeWorker {
    worker_id: String,
    run_id: String,
    queue: WorkQueue,
    sink: ResultSink,
    results: ResultTable,
    source: Arc<dyn ScrapeSource>,
    batch_size: usize,
    heartbeat_interval: Duration,
    retry_policy: RetryPolicy,
}

impl ScrapeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        queue: WorkQueue,
        sink: ResultSink,
        results: ResultTable,
        source: Arc<dyn ScrapeSource>,
        batch_size: usize,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            worker_id: new_worker_id(),
            run_id: run_id.into(),
            queue,
            sink,
            results,
            source,
            batch_size,
            heartbeat_interval,
            retry_policy: RetryPolicy::new(DEFAULT_MAX_ATTEMPTS, true),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Policy used to report whether a failed item will run again
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Fetch one item and write its results; never fails, failures are the
    /// returned outcome.
    pub async fn process_item(&self, item_key: &str) -> Outcome {
        let rows = match self.source.fetch(item_key).await {
            Ok(rows) => rows,
            Err(e) => {
                return Outcome::Failed {
                    error: truncate_error(format!("{e:#}"), MAX_ERROR_LEN),
                }
            },
        };

        let records: Vec<ResultRecord> = rows
            .into_iter()
            .filter(|row| self.source.is_meaningful(row))
            .map(|row| self.source.to_result(&self.run_id, item_key, row))
            .collect();

        if records.is_empty() {
            return Outcome::ZeroResult;
        }

        match self.sink.upsert_batch(&self.results, &records).await {
            Ok(_) => Outcome::Completed {
                result_count: records.len(),
            },
            Err(e) => Outcome::Failed {
                error: truncate_error(format!("result sink: {e}"), MAX_ERROR_LEN),
            },
        }
    }

    fn start_heartbeat_task(
        &self,
        keys: Vec<String>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let run_id = self.run_id.clone();
        let worker_id = self.worker_id.clone();
        let heartbeat_interval = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.touch_claims(&run_id, &worker_id, &keys).await {
                            tracing::warn!(worker_id = %worker_id, error = %e, "Claim heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    async fn process_batch(
        &self,
        batch: &[ClaimedItem],
        cancel: &CancellationToken,
        stats: &mut WorkerStats,
    ) -> EngineResult<()> {
        for item in batch {
            if cancel.is_cancelled() {
                let released = self.queue.release_claims(&self.run_id, &self.worker_id).await?;
                stats.released += released;
                tracing::info!(
                    worker_id = %self.worker_id,
                    released,
                    "Cancelled mid-batch, released unstarted claims"
                );
                return Ok(());
            }

            let outcome = self.process_item(&item.item_key).await;

            if let Outcome::Failed { ref error } = outcome {
                let attempt = item.attempts + 1;
                if self.retry_policy.should_retry(attempt) {
                    tracing::warn!(
                        run_id = %self.run_id,
                        item_key = %item.item_key,
                        attempt,
                        error = %error,
                        "Item failed, will retry"
                    );
                } else {
                    tracing::error!(
                        run_id = %self.run_id,
                        item_key = %item.item_key,
                        attempt,
                        error = %error,
                        "Item failed permanently"
                    );
                }
            }

            let held = self
                .queue
                .complete(&self.run_id, &item.item_key, &self.worker_id, &outcome)
                .await?;

            if held {
                stats.record(&outcome);
            } else {
                stats.lost_claims += 1;
            }
        }

        Ok(())
    }

    /// Claim and process batches until the queue has no pending items or
    /// `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> EngineResult<WorkerStats> {
        let mut stats = WorkerStats::default();

        tracing::debug!(
            worker_id = %self.worker_id,
            run_id = %self.run_id,
            batch_size = self.batch_size,
            "Worker starting"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let batch = self
                .queue
                .claim_batch(&self.run_id, &self.worker_id, self.batch_size)
                .await?;

            if batch.is_empty() {
                tracing::debug!(worker_id = %self.worker_id, "No pending items left");
                break;
            }

            stats.batches += 1;
            stats.claimed += batch.len() as u64;

            let keys = batch.iter().map(|item| item.item_key.clone()).collect();
            let heartbeat_cancel = cancel.child_token();
            let heartbeat = self.start_heartbeat_task(keys, heartbeat_cancel.clone());
            // Stops the heartbeat even when processing panics
            let heartbeat_guard = heartbeat_cancel.drop_guard();

            let result = self.process_batch(&batch, &cancel, &mut stats).await;

            drop(heartbeat_guard);
            if let Err(e) = heartbeat.await {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "Heartbeat task ended abnormally");
            }

            result?;
        }

        tracing::info!(
            worker_id = %self.worker_id,
            run_id = %self.run_id,
            batches = stats.batches,
            completed = stats.completed,
            zero_result = stats.zero_result,
            failed = stats.failed,
            lost_claims = stats.lost_claims,
            "Worker stopped"
        );

        Ok(stats)
    }
}
