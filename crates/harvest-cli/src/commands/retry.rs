//! `harvest retry` command implementation
//!
//! Reopens a closed run as `resume` and moves its failed items (and any keys
//! given with `--item`) back to pending. The next `demo` (or any coordinator
//! for that scraper) picks the run up and works only those items.

use anyhow::{bail, Context, Result};
use harvest_engine::config::HarvestConfig;
use harvest_engine::ledger::LedgerStore;
use harvest_engine::queue::WorkQueue;
use harvest_engine::retry::{RetryManager, RetryPolicy};
use harvest_engine::tables::SourceTables;
use harvest_engine::QueueCounts;

use super::connect;

/// Options of one retry invocation
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub include_exhausted: bool,
    pub zero_results: bool,
    /// Keys to put back to pending whatever their current status
    pub items: Vec<String>,
}

impl RetryOptions {
    /// Whether the run has anything these options would requeue.
    /// `exhausted` is the number of failed items out of attempts.
    pub fn has_work(&self, counts: &QueueCounts, exhausted: usize) -> bool {
        let failed = if self.include_exhausted {
            counts.failed
        } else {
            counts.failed - exhausted as i64
        };
        failed > 0 || (self.zero_results && counts.zero_result > 0) || !self.items.is_empty()
    }
}

pub async fn run(run_id: &str, prefix: &str, options: RetryOptions) -> Result<u8> {
    let config = HarvestConfig::from_env().context("Loading harvest configuration")?;
    let tables = SourceTables::new(prefix)?;
    let pool = connect(0).await?;

    let ledger = LedgerStore::new(pool.clone());
    let queue = WorkQueue::new(pool, &tables);
    let retry = RetryManager::new(
        queue.clone(),
        ledger.clone(),
        RetryPolicy::new(config.max_attempts, config.zero_result_recheck),
    );

    if ledger.get(run_id).await?.is_none() {
        bail!("run {run_id} not found");
    }

    let counts = queue.counts(run_id).await.context("Reading queue counts")?;
    let exhausted = retry.permanent_failures(run_id).await.context("Listing permanent failures")?;
    if !options.has_work(&counts, exhausted.len()) {
        println!("Nothing to retry for run {run_id}.");
        return Ok(0);
    }

    // Reopen before requeueing so pending items never sit in a closed run
    let run = ledger.reopen(run_id).await.with_context(|| format!("Reopening run {run_id}"))?;

    let failed = retry
        .retry_failed(run_id, options.include_exhausted)
        .await
        .context("Requeueing failed items")?;
    let zero = if options.zero_results {
        retry.retry_zero_results(run_id).await.context("Requeueing zero-result items")?
    } else {
        0
    };
    let (inserted, reset) = if options.items.is_empty() {
        (0, 0)
    } else {
        queue
            .seed_with_reset(run_id, &options.items)
            .await
            .context("Requeueing named items")?
    };

    tracing::info!(run_id = %run_id, failed, zero, inserted, reset, "Run reopened for retry");
    println!(
        "Requeued {failed} failed, {zero} zero-result and {} named item(s); run {} is {}.",
        inserted + reset,
        run.run_id,
        run.status
    );

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(failed: i64, zero_result: i64) -> QueueCounts {
        QueueCounts {
            pending: 0,
            in_progress: 0,
            completed: 10,
            failed,
            zero_result,
        }
    }

    #[test]
    fn test_has_work() {
        let plain = RetryOptions::default();
        assert!(!plain.has_work(&counts(0, 4), 0));
        assert!(plain.has_work(&counts(3, 0), 2));
        // Only exhausted failures left
        assert!(!plain.has_work(&counts(3, 0), 3));

        let exhausted = RetryOptions {
            include_exhausted: true,
            ..RetryOptions::default()
        };
        assert!(exhausted.has_work(&counts(3, 0), 3));

        let zero = RetryOptions {
            zero_results: true,
            ..RetryOptions::default()
        };
        assert!(zero.has_work(&counts(0, 4), 0));

        let named = RetryOptions {
            items: vec!["item-001".to_string()],
            ..RetryOptions::default()
        };
        assert!(named.has_work(&counts(0, 0), 0));
    }
}
