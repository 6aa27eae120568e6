//! Work queue and claim engine
//!
//! The `<prefix>_work_queue` table is the queue: there is no broker and no
//! in-memory leader. Workers in any number of processes claim pending items
//! with a single `FOR UPDATE SKIP LOCKED` statement and report outcomes with
//! updates guarded on the claim they hold.
//!
//! Item lifecycle:
//!
//! ```text
//! pending ──claim──▶ in_progress ──complete──▶ completed | zero_result | failed
//!    ▲                   │                                   │
//!    └────reclaim────────┘                                   │
//!    └────────────────────────retry──────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::EngineResult;
use crate::tables::SourceTables;
use crate::types::{
    ClaimedItem, ItemStatus, Outcome, PermanentFailure, QueueCounts, WorkItem, WorkItemRow,
};

/// Default number of rows per multi-row INSERT
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// What `sync_remaining` changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Distinct input keys
    pub input: usize,
    /// Keys that still need processing after the sync
    pub remaining: usize,
    /// Remaining keys that were not in the queue yet
    pub inserted: u64,
    /// Failed keys moved back to pending
    pub requeued: u64,
    /// Pending keys already present in the result table
    pub marked_completed: u64,
    /// Pending keys no longer in the input
    pub removed: u64,
}

impl SyncReport {
    pub fn changed(&self) -> bool {
        self.inserted + self.requeued + self.marked_completed + self.removed > 0
    }
}

/// Work queue for one source prefix
#[derive(Debug, Clone)]
pub struct WorkQueue {
    pool: PgPool,
    table: String,
    chunk_size: usize,
}

impl WorkQueue {
    pub fn new(pool: PgPool, tables: &SourceTables) -> Self {
        Self {
            pool,
            table: tables.work_queue().to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert pending items for `keys`. Existing keys are left untouched and
    /// duplicates in the input collapse to their first occurrence.
    ///
    /// Returns the number of rows inserted.
    pub async fn seed(&self, run_id: &str, keys: &[String]) -> EngineResult<u64> {
        let keys = dedup_preserving_order(keys);
        let mut tx = self.pool.begin().await?;
        let inserted = self.insert_pending(&mut tx, run_id, &keys).await?;
        tx.commit().await?;

        tracing::info!(
            run_id = %run_id,
            table = %self.table,
            requested = keys.len(),
            inserted,
            "Work queue seeded"
        );

        Ok(inserted)
    }

    /// Seed, and move keys that already reached a final status back to
    /// pending. In-progress items are not touched.
    ///
    /// Returns `(inserted, reset)`.
    pub async fn seed_with_reset(&self, run_id: &str, keys: &[String]) -> EngineResult<(u64, u64)> {
        let keys = dedup_preserving_order(keys);
        let mut tx = self.pool.begin().await?;

        let inserted = self.insert_pending(&mut tx, run_id, &keys).await?;

        let reset = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending', completed_at = NULL, updated_at = NOW()
            WHERE run_id = $1 AND item_key = ANY($2)
              AND status IN ('completed', 'failed', 'zero_result')
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(&keys)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        tracing::info!(run_id = %run_id, inserted, reset, "Work queue seeded with reset");
        Ok((inserted, reset))
    }

    async fn insert_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        run_id: &str,
        keys: &[String],
    ) -> EngineResult<u64> {
        let mut inserted = 0;

        for chunk in keys.chunks(self.chunk_size) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (run_id, item_key) ", self.table));

            builder.push_values(chunk, |mut b, key| {
                b.push_bind(run_id).push_bind(key);
            });
            builder.push(" ON CONFLICT (run_id, item_key) DO NOTHING");

            inserted += builder.build().execute(&mut **tx).await?.rows_affected();
        }

        Ok(inserted)
    }

    /// Atomically claim up to `limit` pending items, oldest first.
    ///
    /// Concurrent callers never receive the same item: locked rows are
    /// skipped rather than waited on.
    pub async fn claim_batch(
        &self,
        run_id: &str,
        worker_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<ClaimedItem>> {
        let mut claimed: Vec<ClaimedItem> = sqlx::query_as(&format!(
            r#"
            WITH next_items AS (
                SELECT seq
                FROM {table}
                WHERE run_id = $1 AND status = 'pending'
                ORDER BY seq
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} q
            SET status = 'in_progress',
                claimed_by = $2,
                claimed_at = NOW(),
                started_at = NOW(),
                updated_at = NOW()
            FROM next_items
            WHERE q.seq = next_items.seq
            RETURNING q.seq, q.item_key, q.attempts
            "#,
            table = self.table
        ))
        .bind(run_id)
        .bind(worker_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        // RETURNING order is unspecified
        claimed.sort_by_key(|item| item.seq);

        if !claimed.is_empty() {
            tracing::debug!(
                run_id = %run_id,
                worker_id = %worker_id,
                claimed = claimed.len(),
                "Claimed batch"
            );
        }

        Ok(claimed)
    }

    /// Record the outcome of a claimed item.
    ///
    /// Returns `false` when the worker no longer holds the claim (it was
    /// reclaimed and possibly handed to someone else); nothing is changed then.
    pub async fn complete(
        &self,
        run_id: &str,
        item_key: &str,
        worker_id: &str,
        outcome: &Outcome,
    ) -> EngineResult<bool> {
        let status = outcome.status();

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $4,
                claimed_by = NULL,
                claimed_at = NULL,
                completed_at = NOW(),
                attempts = attempts + CASE WHEN $4 = 'failed' THEN 1 ELSE 0 END,
                last_error = $5,
                updated_at = NOW()
            WHERE run_id = $1 AND item_key = $2
              AND status = 'in_progress' AND claimed_by = $3
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(item_key)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(outcome.error())
        .execute(&self.pool)
        .await?;

        let held = result.rows_affected() == 1;
        if !held {
            tracing::warn!(
                run_id = %run_id,
                item_key = %item_key,
                worker_id = %worker_id,
                outcome = %status,
                "Claim lost before completion, outcome discarded"
            );
        }

        Ok(held)
    }

    /// Refresh `claimed_at` on items the worker still holds.
    pub async fn touch_claims(
        &self,
        run_id: &str,
        worker_id: &str,
        keys: &[String],
    ) -> EngineResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET claimed_at = NOW(), updated_at = NOW()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'in_progress'
              AND item_key = ANY($3)
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(worker_id)
        .bind(keys)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Return every item the worker holds to pending.
    pub async fn release_claims(&self, run_id: &str, worker_id: &str) -> EngineResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                started_at = NULL, updated_at = NOW()
            WHERE run_id = $1 AND claimed_by = $2 AND status = 'in_progress'
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Return in-progress items to pending. With `older_than`, only claims
    /// whose `claimed_at` is older than that are reset.
    pub async fn reset_in_progress(
        &self,
        run_id: &str,
        older_than: Option<Duration>,
    ) -> EngineResult<u64> {
        let threshold_secs = older_than.map(|d| d.as_secs() as i64);

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                started_at = NULL, updated_at = NOW()
            WHERE run_id = $1 AND status = 'in_progress'
              AND ($2::bigint IS NULL OR claimed_at < NOW() - $2::bigint * INTERVAL '1 second')
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(threshold_secs)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Failed items back to pending. With `max_attempts`, only items that
    /// still have attempts left.
    pub async fn requeue_failed(&self, run_id: &str, max_attempts: Option<i32>) -> EngineResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending', completed_at = NULL, updated_at = NOW()
            WHERE run_id = $1 AND status = 'failed'
              AND ($2::int IS NULL OR attempts < $2::int)
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn requeue_zero_results(&self, run_id: &str) -> EngineResult<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending', completed_at = NULL, updated_at = NOW()
            WHERE run_id = $1 AND status = 'zero_result'
            "#,
            self.table
        ))
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Failed items that used up their attempts, in queue order
    pub async fn permanent_failures(
        &self,
        run_id: &str,
        max_attempts: i32,
    ) -> EngineResult<Vec<PermanentFailure>> {
        let failures = sqlx::query_as(&format!(
            r#"
            SELECT item_key, attempts, last_error
            FROM {}
            WHERE run_id = $1 AND status = 'failed' AND attempts >= $2
            ORDER BY seq
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(failures)
    }

    /// Aggregate counts per status
    pub async fn counts(&self, run_id: &str) -> EngineResult<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT status, COUNT(*) FROM {} WHERE run_id = $1 GROUP BY status",
            self.table
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, count);
        }

        Ok(counts)
    }

    pub async fn keys_in_status(
        &self,
        run_id: &str,
        statuses: &[ItemStatus],
    ) -> EngineResult<Vec<String>> {
        let statuses: Vec<&str> = statuses.iter().map(ItemStatus::as_str).collect();

        let keys = sqlx::query_scalar(&format!(
            "SELECT item_key FROM {} WHERE run_id = $1 AND status = ANY($2) ORDER BY seq",
            self.table
        ))
        .bind(run_id)
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    pub async fn get_item(&self, run_id: &str, item_key: &str) -> EngineResult<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT seq, run_id, item_key, status, claimed_by, claimed_at, attempts,
                   last_error, started_at, completed_at
            FROM {}
            WHERE run_id = $1 AND item_key = $2
            "#,
            self.table
        ))
        .bind(run_id)
        .bind(item_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItem::try_from).transpose()
    }

    /// Make the queue hold exactly the work a resumed run still owes.
    ///
    /// Remaining = input − `materialized` − terminal, where terminal is
    /// completed, zero_result, or failed with no attempts left. Remaining
    /// keys end up pending (inserted or moved back from failed); pending keys
    /// already materialized are marked completed, and pending keys no longer
    /// in the input are removed. Terminal items are never touched. Calling it
    /// again with the same inputs changes nothing.
    pub async fn sync_remaining(
        &self,
        run_id: &str,
        input_keys: &[String],
        materialized: &HashSet<String>,
        max_attempts: i32,
    ) -> EngineResult<SyncReport> {
        let input = dedup_preserving_order(input_keys);
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String, String, i32)> = sqlx::query_as(&format!(
            "SELECT item_key, status, attempts FROM {} WHERE run_id = $1 FOR UPDATE",
            self.table
        ))
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut queued: HashMap<String, ItemStatus> = HashMap::with_capacity(rows.len());
        let mut terminal: HashSet<String> = HashSet::new();
        for (key, status, attempts) in rows {
            let status: ItemStatus = status.parse()?;
            let is_terminal = match status {
                ItemStatus::Completed | ItemStatus::ZeroResult => true,
                ItemStatus::Failed => attempts >= max_attempts,
                ItemStatus::Pending | ItemStatus::InProgress => false,
            };
            if is_terminal {
                terminal.insert(key.clone());
            }
            queued.insert(key, status);
        }

        let remaining = remaining_keys(&input, materialized, &terminal);
        let remaining_set: HashSet<&str> = remaining.iter().map(String::as_str).collect();

        let to_insert: Vec<String> =
            remaining.iter().filter(|k| !queued.contains_key(*k)).cloned().collect();
        let to_requeue: Vec<String> = remaining
            .iter()
            .filter(|k| queued.get(*k) == Some(&ItemStatus::Failed))
            .cloned()
            .collect();

        let input_set: HashSet<&str> = input.iter().map(String::as_str).collect();
        let mut to_mark_completed = Vec::new();
        let mut to_remove = Vec::new();
        for (key, status) in &queued {
            if *status != ItemStatus::Pending || remaining_set.contains(key.as_str()) {
                continue;
            }
            if materialized.contains(key) {
                to_mark_completed.push(key.clone());
            } else if !input_set.contains(key.as_str()) {
                to_remove.push(key.clone());
            }
        }

        let mut report = SyncReport {
            input: input.len(),
            remaining: remaining.len(),
            ..SyncReport::default()
        };

        report.inserted = self.insert_pending(&mut tx, run_id, &to_insert).await?;

        if !to_requeue.is_empty() {
            report.requeued = sqlx::query(&format!(
                r#"
                UPDATE {}
                SET status = 'pending', completed_at = NULL, updated_at = NOW()
                WHERE run_id = $1 AND status = 'failed' AND item_key = ANY($2)
                "#,
                self.table
            ))
            .bind(run_id)
            .bind(&to_requeue)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        if !to_mark_completed.is_empty() {
            report.marked_completed = sqlx::query(&format!(
                r#"
                UPDATE {}
                SET status = 'completed', completed_at = NOW(), updated_at = NOW()
                WHERE run_id = $1 AND status = 'pending' AND item_key = ANY($2)
                "#,
                self.table
            ))
            .bind(run_id)
            .bind(&to_mark_completed)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        if !to_remove.is_empty() {
            report.removed = sqlx::query(&format!(
                "DELETE FROM {} WHERE run_id = $1 AND status = 'pending' AND item_key = ANY($2)",
                self.table
            ))
            .bind(run_id)
            .bind(&to_remove)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;

        tracing::info!(
            run_id = %run_id,
            input = report.input,
            remaining = report.remaining,
            inserted = report.inserted,
            requeued = report.requeued,
            marked_completed = report.marked_completed,
            removed = report.removed,
            "Resume set synchronized"
        );

        Ok(report)
    }
}

/// Input keys that are neither materialized nor terminal, in input order
/// without duplicates.
pub fn remaining_keys(
    input: &[String],
    materialized: &HashSet<String>,
    terminal: &HashSet<String>,
) -> Vec<String> {
    dedup_preserving_order(input)
        .into_iter()
        .filter(|key| !materialized.contains(key) && !terminal.contains(key))
        .collect()
}

fn dedup_preserving_order(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().filter(|k| seen.insert(k.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_remaining_keys_excludes_materialized_and_terminal() {
        let input = keys(&["a", "b", "c", "d", "e"]);
        let remaining = remaining_keys(&input, &set(&["b"]), &set(&["d", "z"]));
        assert_eq!(remaining, keys(&["a", "c", "e"]));
    }

    #[test]
    fn test_remaining_keys_preserves_first_occurrence_order() {
        let input = keys(&["c", "a", "c", "b", "a"]);
        let remaining = remaining_keys(&input, &HashSet::new(), &HashSet::new());
        assert_eq!(remaining, keys(&["c", "a", "b"]));
    }

    #[test]
    fn test_remaining_keys_all_done() {
        let input = keys(&["a", "b"]);
        assert!(remaining_keys(&input, &set(&["a"]), &set(&["b"])).is_empty());
    }

    #[test]
    fn test_sync_report_changed() {
        assert!(!SyncReport::default().changed());
        let report = SyncReport {
            removed: 1,
            ..SyncReport::default()
        };
        assert!(report.changed());
    }
}
