//! Bounded retry
//!
//! Failed items go back to pending while they have attempts left. Items that
//! came back empty get exactly one recheck per run; the ledger's
//! `zero_result_rechecked` flag makes that hold across processes and restarts.

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::ledger::LedgerStore;
use crate::queue::WorkQueue;
use crate::types::PermanentFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub zero_result_recheck: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: i32, zero_result_recheck: bool) -> Self {
        Self {
            max_attempts,
            zero_result_recheck,
        }
    }

    /// A failed item with `attempts` recorded failures may run again.
    pub fn should_retry(&self, attempts: i32) -> bool {
        attempts < self.max_attempts
    }
}

/// What one retry pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    pub requeued_failed: u64,
    pub requeued_zero_result: u64,
    pub permanent_failures: Vec<PermanentFailure>,
}

impl RetryReport {
    pub fn requeued(&self) -> u64 {
        self.requeued_failed + self.requeued_zero_result
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    queue: WorkQueue,
    ledger: LedgerStore,
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(queue: WorkQueue, ledger: LedgerStore, policy: RetryPolicy) -> Self {
        Self {
            queue,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Requeue retryable failures and, once per run, zero-result items.
    pub async fn apply(&self, run_id: &str) -> EngineResult<RetryReport> {
        let requeued_failed = self
            .queue
            .requeue_failed(run_id, Some(self.policy.max_attempts))
            .await?;

        let mut requeued_zero_result = 0;
        if self.policy.zero_result_recheck {
            let counts = self.queue.counts(run_id).await?;
            if counts.zero_result > 0 && self.ledger.claim_zero_result_recheck(run_id).await? {
                requeued_zero_result = self.queue.requeue_zero_results(run_id).await?;
            }
        }

        let permanent_failures = self.permanent_failures(run_id).await?;

        if requeued_failed > 0 || requeued_zero_result > 0 {
            tracing::info!(
                run_id = %run_id,
                requeued_failed,
                requeued_zero_result,
                permanent_failures = permanent_failures.len(),
                "Retry pass requeued items"
            );
        }

        Ok(RetryReport {
            requeued_failed,
            requeued_zero_result,
            permanent_failures,
        })
    }

    pub async fn permanent_failures(&self, run_id: &str) -> EngineResult<Vec<PermanentFailure>> {
        self.queue
            .permanent_failures(run_id, self.policy.max_attempts)
            .await
    }

    /// Operator-driven retry of failed items. With `include_exhausted`, items
    /// past the attempt budget are requeued too; `attempts` is kept as is.
    pub async fn retry_failed(&self, run_id: &str, include_exhausted: bool) -> EngineResult<u64> {
        let limit = if include_exhausted {
            None
        } else {
            Some(self.policy.max_attempts)
        };

        let requeued = self.queue.requeue_failed(run_id, limit).await?;
        tracing::info!(run_id = %run_id, requeued, include_exhausted, "Failed items requeued");
        Ok(requeued)
    }

    /// Operator-driven requeue of zero-result items, outside the one-shot budget.
    pub async fn retry_zero_results(&self, run_id: &str) -> EngineResult<u64> {
        let requeued = self.queue.requeue_zero_results(run_id).await?;
        tracing::info!(run_id = %run_id, requeued, "Zero-result items requeued");
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_below_budget() {
        let policy = RetryPolicy::new(3, true);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(7));
    }

    #[test]
    fn test_single_attempt_budget() {
        let policy = RetryPolicy::new(1, false);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_report_requeued() {
        let report = RetryReport {
            requeued_failed: 2,
            requeued_zero_result: 5,
            permanent_failures: Vec::new(),
        };
        assert_eq!(report.requeued(), 7);
    }
}
