//! Run coordinator
//!
//! Drives one scraper run end to end:
//! 1. Prepare: recover leftovers, then resume the scraper's open run or start
//!    a fresh one and seed its queue
//! 2. Run: worker pool rounds with retry passes, alongside the reclaimer and
//!    progress reporter
//! 3. Finalize: write the final ledger status exactly once

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::best_effort::BestEffort;
use crate::config::HarvestConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::LedgerStore;
use crate::progress::ProgressReporter;
use crate::queue::{SyncReport, WorkQueue};
use crate::reclaim::{reset_all_in_progress, StaleClaimReclaimer};
use crate::retry::{RetryManager, RetryPolicy};
use crate::sink::ResultSink;
use crate::source::ScrapeSource;
use crate::tables::SourceTables;
use crate::types::{PermanentFailure, QueueCounts, RunMode, RunStatus};
use crate::watch::RunStatusWatcher;
use crate::worker::{new_worker_id, ScrapeWorker, WorkerStats};

/// Permanent-failure keys listed in the ledger totals
const MAX_FAILURE_KEYS_IN_TOTALS: usize = 50;

/// Everything a run needs, passed explicitly
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: PgPool,
    pub config: HarvestConfig,
    pub tables: SourceTables,
    pub source: Arc<dyn ScrapeSource>,
    pub ledger: LedgerStore,
    pub queue: WorkQueue,
    pub sink: ResultSink,
}

impl PipelineContext {
    pub fn new(
        pool: PgPool,
        config: HarvestConfig,
        tables: SourceTables,
        source: Arc<dyn ScrapeSource>,
    ) -> Self {
        let ledger = LedgerStore::new(pool.clone());
        let queue = WorkQueue::new(pool.clone(), &tables).with_chunk_size(config.upsert_chunk_size);
        let sink = ResultSink::new(pool.clone()).with_chunk_size(config.upsert_chunk_size);

        Self {
            pool,
            config,
            tables,
            source,
            ledger,
            queue,
            sink,
        }
    }

    pub fn scraper_name(&self) -> &str {
        self.source.name()
    }

    pub fn retry_manager(&self) -> RetryManager {
        RetryManager::new(
            self.queue.clone(),
            self.ledger.clone(),
            RetryPolicy::new(self.config.max_attempts, self.config.zero_result_recheck),
        )
    }
}

/// The run chosen by [`Coordinator::prepare`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub mode: RunMode,
    /// Items inserted by a fresh seed
    pub seeded: u64,
    /// Resume recomputation, for resumed runs
    pub sync: Option<SyncReport>,
}

/// Result of one worker pool round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    pub stats: WorkerStats,
    /// Workers that exited with an error or panicked
    pub worker_failures: usize,
}

impl PoolReport {
    /// Process exit code for an attached process; see [`worker_failure_exit_code`].
    pub fn exit_code(&self) -> u8 {
        worker_failure_exit_code(self.worker_failures)
    }

    fn merge(&mut self, other: &PoolReport) {
        self.stats.merge(&other.stats);
        self.worker_failures += other.worker_failures;
    }
}

/// How a run ended
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    /// `None` when the queue could not be read at the end
    pub counts: Option<QueueCounts>,
    pub permanent_failures: Vec<PermanentFailure>,
    pub worker_failures: usize,
    pub items_exported: i64,
    pub workers: WorkerStats,
    /// Whether this call wrote the final ledger status
    pub finalized: bool,
}

impl RunSummary {
    /// Process exit code: 0 when clean, 1 when the run failed, otherwise the
    /// worker failure count clamped to 2..=125.
    pub fn exit_code(&self) -> u8 {
        if self.status == RunStatus::Failed {
            return 1;
        }
        worker_failure_exit_code(self.worker_failures)
    }
}

/// 0 without worker failures, otherwise the count clamped to 2..=125 so it
/// never collides with 1 (run failed) or the shell's signal codes.
pub fn worker_failure_exit_code(worker_failures: usize) -> u8 {
    match worker_failures {
        0 => 0,
        n => n.clamp(2, 125) as u8,
    }
}

/// Final status for a run given its last queue counts.
///
/// Unknown counts mean the store is unusable: `failed`. Remaining work means
/// the run was interrupted: `resume`, or `partial` when interrupted runs are
/// not to be continued. Otherwise `completed`, even with permanent failures.
pub fn final_status(counts: Option<&QueueCounts>, resume_on_interrupt: bool) -> RunStatus {
    match counts {
        None => RunStatus::Failed,
        Some(c) if c.remaining() > 0 => {
            if resume_on_interrupt {
                RunStatus::Resume
            } else {
                RunStatus::Partial
            }
        },
        Some(_) => RunStatus::Completed,
    }
}

pub struct Coordinator {
    ctx: PipelineContext,
    finalized: AtomicBool,
}

impl Coordinator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Choose the run to work on and make its queue ready.
    pub async fn prepare(&self, input_keys: &[String]) -> EngineResult<RunHandle> {
        let scraper = self.ctx.scraper_name().to_string();
        self.finalized.store(false, Ordering::SeqCst);

        self.ctx.tables.ensure_schema(&self.ctx.pool).await?;
        self.ctx.ledger.recover_on_startup(Some(&scraper)).await?;

        if let Some(open) = self.ctx.ledger.latest_resumable(&scraper).await? {
            let run = self.ctx.ledger.resume(&open.run_id).await?;
            reset_all_in_progress(&self.ctx.queue, &run.run_id).await?;
            let sync = self.sync_on_resume(&run.run_id, input_keys).await?;

            tracing::info!(
                run_id = %run.run_id,
                scraper = %scraper,
                remaining = sync.remaining,
                "Resuming run"
            );

            return Ok(RunHandle {
                run_id: run.run_id,
                mode: RunMode::Resume,
                seeded: 0,
                sync: Some(sync),
            });
        }

        let run_id = Uuid::now_v7().to_string();
        self.ctx.ledger.start(&run_id, &scraper, RunMode::Fresh).await?;
        let seeded = self.ctx.queue.seed(&run_id, input_keys).await?;

        Ok(RunHandle {
            run_id,
            mode: RunMode::Fresh,
            seeded,
            sync: None,
        })
    }

    /// Recompute what a resumed run still owes: input minus keys with stored
    /// results minus keys already final in this run's queue.
    pub async fn sync_on_resume(&self, run_id: &str, input_keys: &[String]) -> EngineResult<SyncReport> {
        let materialized = self.ctx.sink.materialized_keys(self.ctx.tables.results()).await?;
        self.ctx
            .queue
            .sync_remaining(run_id, input_keys, &materialized, self.ctx.config.max_attempts)
            .await
    }

    /// One round: `worker_count` workers until the queue has nothing pending
    /// for them or `cancel` fires.
    pub async fn run_worker_pool(&self, run_id: &str, cancel: &CancellationToken) -> PoolReport {
        let worker_ids: Vec<String> = (0..self.ctx.config.worker_count).map(|_| new_worker_id()).collect();

        let handles: Vec<_> = worker_ids
            .iter()
            .map(|worker_id| {
                let worker = ScrapeWorker::new(
                    run_id,
                    self.ctx.queue.clone(),
                    self.ctx.sink.clone(),
                    self.ctx.tables.results().clone(),
                    self.ctx.source.clone(),
                    self.ctx.config.batch_size,
                    self.ctx.config.heartbeat_interval(),
                )
                .with_worker_id(worker_id.clone())
                .with_retry_policy(*self.ctx.retry_manager().policy());
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect();

        let results = futures::future::join_all(handles).await;

        let mut report = PoolReport::default();
        for (worker_id, result) in worker_ids.iter().zip(results) {
            let failure = match result {
                Ok(Ok(stats)) => {
                    report.stats.merge(&stats);
                    continue;
                },
                Ok(Err(e)) => e,
                Err(join_error) => EngineError::Worker(format!("task panicked: {join_error}")),
            };

            report.worker_failures += 1;
            tracing::error!(run_id = %run_id, worker_id = %worker_id, error = %failure, "Worker failed");

            // Hand the dead worker's items straight back instead of waiting for the reclaimer
            self.ctx
                .queue
                .release_claims(run_id, worker_id)
                .await
                .or_log("Releasing claims of failed worker");
        }

        report
    }

    /// Work the run until nothing is pending or in progress, until `cancel`
    /// fires, or until the ledger row is closed elsewhere, then finalize it.
    pub async fn run(&self, handle: &RunHandle, cancel: CancellationToken) -> EngineResult<RunSummary> {
        let run_id = handle.run_id.as_str();
        let config = &self.ctx.config;

        tracing::info!(
            run_id = %run_id,
            scraper = %self.ctx.scraper_name(),
            mode = %handle.mode,
            workers = config.worker_count,
            batch_size = config.batch_size,
            "Run starting"
        );

        // Fires on the caller's cancel or when the run is stopped externally
        let run_cancel = cancel.child_token();
        let background = run_cancel.child_token();
        let watcher = RunStatusWatcher::new(self.ctx.ledger.clone(), run_id, config.idle_poll_interval())
            .spawn(run_cancel.clone(), background.clone());
        let reclaimer = StaleClaimReclaimer::new(
            self.ctx.queue.clone(),
            run_id,
            config.stale_claim_threshold(),
            config.reclaim_interval(),
        )
        .spawn(background.clone());
        let reporter = ProgressReporter::new(
            self.ctx.pool.clone(),
            &self.ctx.tables,
            self.ctx.queue.clone(),
            self.ctx.ledger.clone(),
            run_id,
            config.progress_interval(),
            config.snapshot_interval(),
        )
        .spawn(background.clone());

        let retry = self.ctx.retry_manager();
        let mut pool_report = PoolReport::default();
        let mut store_error: Option<EngineError> = None;

        loop {
            let round = self.run_worker_pool(run_id, &run_cancel).await;
            pool_report.merge(&round);

            if run_cancel.is_cancelled() {
                tracing::info!(run_id = %run_id, "Run interrupted");
                break;
            }

            if round.worker_failures == config.worker_count {
                tracing::error!(run_id = %run_id, "Every worker failed, stopping run");
                break;
            }

            match retry.apply(run_id).await {
                Ok(report) if report.requeued() > 0 => continue,
                Ok(_) => {},
                Err(e) => {
                    store_error = Some(e);
                    break;
                },
            }

            let counts = match self.ctx.queue.counts(run_id).await {
                Ok(counts) => counts,
                Err(e) => {
                    store_error = Some(e);
                    break;
                },
            };

            if counts.pending > 0 {
                continue;
            }
            if counts.in_progress == 0 {
                break;
            }

            // Other processes still hold claims; wait for them or for the reclaimer
            tracing::debug!(run_id = %run_id, in_progress = counts.in_progress, "Waiting on foreign claims");
            tokio::select! {
                _ = run_cancel.cancelled() => break,
                _ = tokio::time::sleep(config.idle_poll_interval()) => {},
            }
        }

        background.cancel();
        match watcher.await {
            Ok(Some(status)) => tracing::info!(run_id = %run_id, status = %status, "Run was closed externally"),
            Ok(None) => {},
            Err(e) => tracing::warn!(error = %e, "Status watcher ended abnormally"),
        }
        if let Err(e) = reclaimer.await {
            tracing::warn!(error = %e, "Reclaimer task ended abnormally");
        }
        if let Err(e) = reporter.await {
            tracing::warn!(error = %e, "Progress task ended abnormally");
        }

        self.finalize(run_id, handle.mode, pool_report, store_error).await
    }

    /// Join an existing run as extra workers. Nothing is reset and the run is
    /// not finalized; the owning process does that. Returns once the queue
    /// has nothing pending, `cancel` fires or the run is closed.
    pub async fn attach(&self, run_id: &str, cancel: CancellationToken) -> EngineResult<PoolReport> {
        let run = self
            .ctx
            .ledger
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        if !run.status.is_resumable() {
            return Err(EngineError::NotResumable {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }

        tracing::info!(run_id = %run_id, workers = self.ctx.config.worker_count, "Attaching to run");

        let run_cancel = cancel.child_token();
        let background = run_cancel.child_token();
        let watcher = RunStatusWatcher::new(self.ctx.ledger.clone(), run_id, self.ctx.config.idle_poll_interval())
            .spawn(run_cancel.clone(), background.clone());

        let mut report = PoolReport::default();
        let outcome = loop {
            let round = self.run_worker_pool(run_id, &run_cancel).await;
            report.merge(&round);

            if run_cancel.is_cancelled() || round.worker_failures == self.ctx.config.worker_count {
                break Ok(());
            }
            match self.ctx.queue.counts(run_id).await {
                Ok(counts) if counts.pending == 0 => break Ok(()),
                Ok(_) => {},
                Err(e) => break Err(e),
            }
        };

        background.cancel();
        if let Err(e) = watcher.await {
            tracing::warn!(error = %e, "Status watcher ended abnormally");
        }

        outcome.map(|()| report)
    }

    async fn finalize(
        &self,
        run_id: &str,
        mode: RunMode,
        pool_report: PoolReport,
        store_error: Option<EngineError>,
    ) -> EngineResult<RunSummary> {
        let counts = match self.ctx.queue.counts(run_id).await {
            Ok(counts) => Some(counts),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Final counts unavailable");
                None
            },
        };

        let status = final_status(counts.as_ref(), self.ctx.config.resume_on_interrupt);

        let permanent_failures = self
            .ctx
            .retry_manager()
            .permanent_failures(run_id)
            .await
            .or_log("Listing permanent failures")
            .unwrap_or_default();

        let items_exported = self
            .ctx
            .sink
            .count_for_run(self.ctx.tables.results(), run_id)
            .await
            .or_log("Counting exported results")
            .unwrap_or(0);

        let error_message = match (&store_error, permanent_failures.len(), pool_report.worker_failures) {
            (Some(e), _, _) => Some(e.to_string()),
            (None, 0, 0) => None,
            (None, 0, workers) => Some(format!("{workers} worker(s) exited with errors")),
            (None, failed, _) => Some(format!("{failed} item(s) failed permanently")),
        };

        let failure_keys: Vec<&str> = permanent_failures
            .iter()
            .take(MAX_FAILURE_KEYS_IN_TOTALS)
            .map(|f| f.item_key.as_str())
            .collect();

        let totals = json!({
            "mode": mode.as_str(),
            "counts": counts,
            "permanent_failures": permanent_failures.len(),
            "permanent_failure_keys": failure_keys,
            "worker_failures": pool_report.worker_failures,
            "results_written": pool_report.stats.results_written,
            "lost_claims": pool_report.stats.lost_claims,
        });

        let finalized = if self.finalized.swap(true, Ordering::SeqCst) {
            false
        } else {
            self.ctx
                .ledger
                .finish(
                    run_id,
                    status,
                    counts.map(|c| c.scraped()).unwrap_or(0),
                    items_exported,
                    error_message.as_deref(),
                    Some(&totals),
                )
                .await?
        };

        // Someone else closed the run (stop, cancel, recover); report what the ledger says
        let status = if finalized {
            status
        } else {
            self.ctx
                .ledger
                .get(run_id)
                .await
                .or_log("Reading final run status")
                .flatten()
                .map(|run| run.status)
                .unwrap_or(status)
        };

        tracing::info!(
            run_id = %run_id,
            status = %status,
            finalized,
            permanent_failures = permanent_failures.len(),
            worker_failures = pool_report.worker_failures,
            items_exported,
            "Run finished"
        );

        Ok(RunSummary {
            run_id: run_id.to_string(),
            status,
            counts,
            permanent_failures,
            worker_failures: pool_report.worker_failures,
            items_exported,
            workers: pool_report.stats,
            finalized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pending: i64, in_progress: i64, failed: i64) -> QueueCounts {
        QueueCounts {
            pending,
            in_progress,
            completed: 10,
            failed,
            zero_result: 0,
        }
    }

    fn summary(status: RunStatus, worker_failures: usize) -> RunSummary {
        RunSummary {
            run_id: "r".to_string(),
            status,
            counts: None,
            permanent_failures: Vec::new(),
            worker_failures,
            items_exported: 0,
            workers: WorkerStats::default(),
            finalized: true,
        }
    }

    #[test]
    fn test_final_status() {
        assert_eq!(final_status(None, true), RunStatus::Failed);
        assert_eq!(final_status(Some(&counts(0, 0, 0)), true), RunStatus::Completed);
        assert_eq!(final_status(Some(&counts(0, 0, 3)), true), RunStatus::Completed);
        assert_eq!(final_status(Some(&counts(5, 0, 0)), true), RunStatus::Resume);
        assert_eq!(final_status(Some(&counts(0, 2, 0)), false), RunStatus::Partial);
    }

    #[test]
    fn test_pool_report_exit_code_matches_run_summary() {
        for failures in [0, 1, 2, 7, 126, 10_000] {
            let report = PoolReport {
                stats: WorkerStats::default(),
                worker_failures: failures,
            };
            assert_eq!(report.exit_code(), summary(RunStatus::Completed, failures).exit_code());
        }
        assert_eq!(worker_failure_exit_code(1), 2);
        assert_eq!(worker_failure_exit_code(126), 125);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(summary(RunStatus::Completed, 0).exit_code(), 0);
        assert_eq!(summary(RunStatus::Resume, 0).exit_code(), 0);
        assert_eq!(summary(RunStatus::Failed, 0).exit_code(), 1);
        assert_eq!(summary(RunStatus::Completed, 1).exit_code(), 2);
        assert_eq!(summary(RunStatus::Completed, 7).exit_code(), 7);
        assert_eq!(summary(RunStatus::Completed, 500).exit_code(), 125);
    }
}
