//! Run ledger
//!
//! One `run_ledger` row per pipeline run. Every transition is a guarded
//! conditional update so that concurrent processes and replays of the same
//! call converge on one answer.
//!
//! Resumable statuses are `running` and `resume`; at most one row per scraper
//! may hold one of them (partial unique index `uq_run_ledger_one_resumable`).

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{EngineError, EngineResult};
use crate::types::{RunMode, RunRecord, RunRow, RunStatus};

const RUN_COLUMNS: &str = r#"
    run_id, scraper_name, status, mode, started_at, ended_at,
    items_scraped, items_exported, error_message, totals_json,
    zero_result_rechecked
"#;

/// Outcome of startup recovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Runs left in (or moved to) `resume`, one per scraper
    pub resumable: Vec<String>,
    /// Older resumable runs forced to `stopped`
    pub stopped: Vec<String>,
}

/// Store for `run_ledger` rows
#[derive(Debug, Clone)]
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new `running` row, stopping any other resumable row of the
    /// same scraper first.
    pub async fn start(
        &self,
        run_id: &str,
        scraper_name: &str,
        mode: RunMode,
    ) -> EngineResult<RunRecord> {
        let mut tx = self.pool.begin().await?;

        let stopped = stop_other_resumable(&mut tx, scraper_name, run_id).await?;

        let row: RunRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO run_ledger (run_id, scraper_name, status, mode)
            VALUES ($1, $2, 'running', $3)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(scraper_name)
        .bind(mode.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            run_id = %run_id,
            scraper = %scraper_name,
            mode = %mode,
            stopped_previous = stopped,
            "Run started"
        );

        row.try_into()
    }

    /// Insert the row if it is missing. An existing row is returned as-is and
    /// its status is never changed.
    pub async fn ensure_exists(
        &self,
        run_id: &str,
        scraper_name: &str,
        mode: RunMode,
    ) -> EngineResult<RunRecord> {
        if let Some(existing) = self.get(run_id).await? {
            return Ok(existing);
        }

        let mut tx = self.pool.begin().await?;

        stop_other_resumable(&mut tx, scraper_name, run_id).await?;

        sqlx::query(
            r#"
            INSERT INTO run_ledger (run_id, scraper_name, status, mode)
            VALUES ($1, $2, 'running', $3)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(scraper_name)
        .bind(mode.as_str())
        .execute(&mut *tx)
        .await?;

        let row: RunRow =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM run_ledger WHERE run_id = $1"))
                .bind(run_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        row.try_into()
    }

    /// Move a resumable run back to `running` in resume mode.
    pub async fn resume(&self, run_id: &str) -> EngineResult<RunRecord> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            r#"
            UPDATE run_ledger
            SET status = 'running', mode = 'resume', ended_at = NULL,
                error_message = NULL, updated_at = NOW()
            WHERE run_id = $1 AND status IN ('running', 'resume')
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                tracing::info!(run_id = %run_id, "Run resumed");
                row.try_into()
            },
            None => match self.get(run_id).await? {
                Some(existing) => Err(EngineError::NotResumable {
                    run_id: run_id.to_string(),
                    status: existing.status.to_string(),
                }),
                None => Err(EngineError::RunNotFound(run_id.to_string())),
            },
        }
    }

    /// Finalize a run.
    ///
    /// Compare-and-swap from a resumable status: returns `false` (and changes
    /// nothing) when the run is already terminal. Counters are absolute values.
    /// `totals` replaces the stored counters when given.
    pub async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        items_scraped: i64,
        items_exported: i64,
        error: Option<&str>,
        totals: Option<&serde_json::Value>,
    ) -> EngineResult<bool> {
        if status == RunStatus::Running {
            return Err(EngineError::InvalidFinalStatus {
                run_id: run_id.to_string(),
                status: status.to_string(),
            });
        }

        // `resume` keeps the run open for the next start, so it has no end time
        let result = sqlx::query(
            r#"
            UPDATE run_ledger
            SET status = $2,
                items_scraped = $3,
                items_exported = $4,
                error_message = $5,
                totals_json = COALESCE($6, totals_json),
                ended_at = CASE WHEN $2 = 'resume' THEN NULL ELSE COALESCE(ended_at, NOW()) END,
                updated_at = NOW()
            WHERE run_id = $1 AND status IN ('running', 'resume')
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(items_scraped)
        .bind(items_exported)
        .bind(error)
        .bind(totals)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() == 1;
        if changed {
            tracing::info!(
                run_id = %run_id,
                status = %status,
                items_scraped,
                items_exported,
                "Run finalized"
            );
        } else {
            tracing::debug!(run_id = %run_id, status = %status, "Finalize skipped, run already terminal");
        }

        Ok(changed)
    }

    /// `running` → `resume`, leaving the run open for the next start.
    pub async fn mark_resumable(&self, run_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_ledger
            SET status = 'resume', updated_at = NOW()
            WHERE run_id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Resumable → `stopped`.
    pub async fn mark_stopped(&self, run_id: &str) -> EngineResult<bool> {
        self.close(run_id, RunStatus::Stopped).await
    }

    /// Resumable → `cancelled`.
    pub async fn cancel(&self, run_id: &str) -> EngineResult<bool> {
        self.close(run_id, RunStatus::Cancelled).await
    }

    async fn close(&self, run_id: &str, status: RunStatus) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_ledger
            SET status = $2, ended_at = COALESCE(ended_at, NOW()), updated_at = NOW()
            WHERE run_id = $1 AND status IN ('running', 'resume')
            "#,
        )
        .bind(run_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() == 1;
        if changed {
            tracing::info!(run_id = %run_id, status = %status, "Run closed");
        }
        Ok(changed)
    }

    /// Put a terminal run back into `resume` so its failed items can be
    /// retried. Any other resumable run of the same scraper is stopped.
    pub async fn reopen(&self, run_id: &str) -> EngineResult<RunRecord> {
        let existing = self
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;

        let mut tx = self.pool.begin().await?;

        stop_other_resumable(&mut tx, &existing.scraper_name, run_id).await?;

        let row: RunRow = sqlx::query_as(&format!(
            r#"
            UPDATE run_ledger
            SET status = 'resume', ended_at = NULL, updated_at = NOW()
            WHERE run_id = $1
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(run_id = %run_id, previous = %existing.status, "Run reopened");
        row.try_into()
    }

    pub async fn get(&self, run_id: &str) -> EngineResult<Option<RunRecord>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM run_ledger WHERE run_id = $1"))
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(RunRecord::try_from).transpose()
    }

    /// The scraper's resumable run, if any
    pub async fn latest_resumable(&self, scraper_name: &str) -> EngineResult<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM run_ledger
            WHERE scraper_name = $1 AND status IN ('running', 'resume')
            ORDER BY started_at DESC, run_id DESC
            LIMIT 1
            "#
        ))
        .bind(scraper_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    /// Most recent runs, optionally for one scraper
    pub async fn list_recent(
        &self,
        scraper_name: Option<&str>,
        limit: i64,
    ) -> EngineResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM run_ledger
            WHERE $1::text IS NULL OR scraper_name = $1
            ORDER BY started_at DESC, run_id DESC
            LIMIT $2
            "#
        ))
        .bind(scraper_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    /// Mirror the live done-count onto an open run.
    pub async fn set_items_scraped(&self, run_id: &str, items_scraped: i64) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE run_ledger
            SET items_scraped = $2, updated_at = NOW()
            WHERE run_id = $1 AND status IN ('running', 'resume')
            "#,
        )
        .bind(run_id)
        .bind(items_scraped)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_totals(&self, run_id: &str, totals: &serde_json::Value) -> EngineResult<()> {
        sqlx::query(
            "UPDATE run_ledger SET totals_json = $2, updated_at = NOW() WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(totals)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Take the run's single zero-result recheck. Only the first caller, in
    /// any process, gets `true`.
    pub async fn claim_zero_result_recheck(&self, run_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_ledger
            SET zero_result_rechecked = TRUE, updated_at = NOW()
            WHERE run_id = $1 AND NOT zero_result_rechecked
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Normalize resumable rows after an unclean shutdown.
    ///
    /// For each scraper the most recently started `running`/`resume` row
    /// becomes `resume`; every older one becomes `stopped`. Candidates are
    /// row-locked for the duration, so concurrent starters serialize here.
    pub async fn recover_on_startup(
        &self,
        scraper_name: Option<&str>,
    ) -> EngineResult<RecoveryReport> {
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT run_id, scraper_name FROM run_ledger
            WHERE status IN ('running', 'resume')
              AND ($1::text IS NULL OR scraper_name = $1)
            ORDER BY scraper_name, started_at DESC, run_id DESC
            FOR UPDATE
            "#,
        )
        .bind(scraper_name)
        .fetch_all(&mut *tx)
        .await?;

        let report = plan_recovery(&candidates);

        // Stop first so the partial unique index never sees two resumable rows
        if !report.stopped.is_empty() {
            sqlx::query(
                r#"
                UPDATE run_ledger
                SET status = 'stopped', ended_at = COALESCE(ended_at, NOW()), updated_at = NOW()
                WHERE run_id = ANY($1)
                "#,
            )
            .bind(&report.stopped)
            .execute(&mut *tx)
            .await?;
        }

        if !report.resumable.is_empty() {
            sqlx::query(
                r#"
                UPDATE run_ledger
                SET status = 'resume', updated_at = NOW()
                WHERE run_id = ANY($1)
                "#,
            )
            .bind(&report.resumable)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if !report.resumable.is_empty() || !report.stopped.is_empty() {
            tracing::info!(
                resumable = ?report.resumable,
                stopped = ?report.stopped,
                "Recovered runs left open by a previous process"
            );
        }

        Ok(report)
    }
}

async fn stop_other_resumable(
    tx: &mut Transaction<'_, Postgres>,
    scraper_name: &str,
    keep_run_id: &str,
) -> EngineResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE run_ledger
        SET status = 'stopped', ended_at = COALESCE(ended_at, NOW()), updated_at = NOW()
        WHERE scraper_name = $1 AND run_id <> $2 AND status IN ('running', 'resume')
        "#,
    )
    .bind(scraper_name)
    .bind(keep_run_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

/// Split candidates (ordered by scraper, newest first) into the run kept per
/// scraper and the ones to stop.
fn plan_recovery(candidates: &[(String, String)]) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let mut current_scraper: Option<&str> = None;

    for (run_id, scraper) in candidates {
        if current_scraper == Some(scraper.as_str()) {
            report.stopped.push(run_id.clone());
        } else {
            current_scraper = Some(scraper.as_str());
            report.resumable.push(run_id.clone());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(run_id: &str, scraper: &str) -> (String, String) {
        (run_id.to_string(), scraper.to_string())
    }

    #[test]
    fn test_plan_recovery_keeps_newest_per_scraper() {
        let candidates = vec![
            candidate("r3", "de"),
            candidate("r2", "de"),
            candidate("r1", "de"),
            candidate("r9", "fr"),
        ];

        let report = plan_recovery(&candidates);
        assert_eq!(report.resumable, vec!["r3", "r9"]);
        assert_eq!(report.stopped, vec!["r2", "r1"]);
    }

    #[test]
    fn test_plan_recovery_empty() {
        assert_eq!(plan_recovery(&[]), RecoveryReport::default());
    }
}
