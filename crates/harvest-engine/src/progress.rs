//! Progress reporter
//!
//! Samples aggregate queue counts on a timer, logs throughput and ETA, and
//! periodically appends a row to `<prefix>_progress_snapshots`. Only aggregate
//! reads are issued, never row locks, so sampling cannot slow claimers down.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::best_effort::BestEffort;
use crate::error::EngineResult;
use crate::ledger::LedgerStore;
use crate::queue::WorkQueue;
use crate::tables::SourceTables;
use crate::types::{ProgressSnapshot, QueueCounts};

/// Throughput and ETA derived from two samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressEstimate {
    /// Items finished per minute since the reporter started
    pub rate_per_min: f64,
    /// Seconds until the remaining items are done at the current rate
    pub eta_seconds: Option<f64>,
    pub percent_done: f64,
}

impl ProgressEstimate {
    /// `baseline_done` is the done-count at the first sample; work finished by
    /// earlier processes does not inflate the rate.
    pub fn compute(counts: &QueueCounts, baseline_done: i64, elapsed: Duration) -> Self {
        let done_since_start = (counts.done() - baseline_done).max(0) as f64;
        let minutes = elapsed.as_secs_f64() / 60.0;

        let rate_per_min = if minutes > 0.0 {
            done_since_start / minutes
        } else {
            0.0
        };

        let remaining = counts.remaining() as f64;
        let eta_seconds = if remaining == 0.0 {
            Some(0.0)
        } else if rate_per_min > 0.0 {
            Some(remaining / rate_per_min * 60.0)
        } else {
            None
        };

        let total = counts.total();
        let percent_done = if total > 0 {
            (counts.done() as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        Self {
            rate_per_min,
            eta_seconds,
            percent_done,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    pool: PgPool,
    queue: WorkQueue,
    ledger: LedgerStore,
    snapshots_table: String,
    run_id: String,
    progress_interval: Duration,
    snapshot_interval: Duration,
}

impl ProgressReporter {
    pub fn new(
        pool: PgPool,
        tables: &SourceTables,
        queue: WorkQueue,
        ledger: LedgerStore,
        run_id: impl Into<String>,
        progress_interval: Duration,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            ledger,
            snapshots_table: tables.snapshots().to_string(),
            run_id: run_id.into(),
            progress_interval,
            snapshot_interval,
        }
    }

    /// Append a snapshot row and mirror the scraped count into the ledger.
    pub async fn record_snapshot(
        &self,
        counts: &QueueCounts,
        estimate: &ProgressEstimate,
    ) -> EngineResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (run_id, pending, in_progress, completed, failed, zero_result,
                            rate_per_min, eta_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.snapshots_table
        ))
        .bind(&self.run_id)
        .bind(counts.pending)
        .bind(counts.in_progress)
        .bind(counts.completed)
        .bind(counts.failed)
        .bind(counts.zero_result)
        .bind(estimate.rate_per_min)
        .bind(estimate.eta_seconds)
        .execute(&self.pool)
        .await?;

        self.ledger
            .set_items_scraped(&self.run_id, counts.scraped())
            .await
    }

    fn log_line(&self, counts: &QueueCounts, estimate: &ProgressEstimate, message: &str) {
        tracing::info!(
            run_id = %self.run_id,
            pending = counts.pending,
            in_progress = counts.in_progress,
            completed = counts.completed,
            failed = counts.failed,
            zero_result = counts.zero_result,
            percent = %format!("{:.1}", estimate.percent_done),
            rate_per_min = %format!("{:.1}", estimate.rate_per_min),
            eta_secs = estimate.eta_seconds.map(|s| s.round() as i64),
            "{message}"
        );
    }

    /// Log every `progress_interval` and snapshot every `snapshot_interval`
    /// until `cancel` fires, then log a final line.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let started = Instant::now();
            let baseline_done = self
                .queue
                .counts(&self.run_id)
                .await
                .or_log("Initial progress sample")
                .map(|c| c.done())
                .unwrap_or(0);

            let mut progress = tokio::time::interval(self.progress_interval);
            let mut snapshot = tokio::time::interval(self.snapshot_interval);
            progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            snapshot.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            progress.tick().await; // Skip first immediate tick
            snapshot.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = progress.tick() => {
                        if let Some(counts) = self.queue.counts(&self.run_id).await.or_log("Progress sample") {
                            let estimate = ProgressEstimate::compute(&counts, baseline_done, started.elapsed());
                            self.log_line(&counts, &estimate, "Progress");
                        }
                    }
                    _ = snapshot.tick() => {
                        if let Some(counts) = self.queue.counts(&self.run_id).await.or_log("Snapshot sample") {
                            let estimate = ProgressEstimate::compute(&counts, baseline_done, started.elapsed());
                            self.record_snapshot(&counts, &estimate).await.or_log("Progress snapshot");
                        }
                    }
                }
            }

            if let Some(counts) = self.queue.counts(&self.run_id).await.or_log("Final progress sample") {
                let estimate = ProgressEstimate::compute(&counts, baseline_done, started.elapsed());
                self.log_line(&counts, &estimate, "Progress reporter stopped");
            }
        })
    }
}

/// Most recent snapshot of a run, if any was recorded
pub async fn latest_snapshot(
    pool: &PgPool,
    tables: &SourceTables,
    run_id: &str,
) -> EngineResult<Option<ProgressSnapshot>> {
    let snapshot = sqlx::query_as(&format!(
        r#"
        SELECT run_id, pending, in_progress, completed, failed, zero_result,
               rate_per_min, eta_seconds, recorded_at
        FROM {}
        WHERE run_id = $1
        ORDER BY recorded_at DESC, id DESC
        LIMIT 1
        "#,
        tables.snapshots()
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    Ok(snapshot)
}
