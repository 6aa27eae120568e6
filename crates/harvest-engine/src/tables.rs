//! Per-source table naming and schema
//!
//! Every source gets its own `<prefix>_work_queue`, `<prefix>_progress_snapshots`
//! and `<prefix>_results` tables. The prefix is interpolated into SQL, so it is
//! validated once here and every query builds on the validated names.

use sqlx::PgPool;
use std::sync::LazyLock;

use crate::error::{EngineError, EngineResult};

static PREFIX_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    regex::Regex::new(r"^[a-z][a-z0-9_]{0,23}$").expect("static prefix pattern")
});

/// Column a result table is deduplicated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKey {
    RunId,
    ItemKey,
    ContentHash,
}

impl ConflictKey {
    pub fn column(&self) -> &'static str {
        match self {
            ConflictKey::RunId => "run_id",
            ConflictKey::ItemKey => "item_key",
            ConflictKey::ContentHash => "content_hash",
        }
    }
}

/// A result table and the natural key it is upserted on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultTable {
    pub name: String,
    pub conflict_keys: Vec<ConflictKey>,
}

impl ResultTable {
    /// Comma-separated conflict column list for `ON CONFLICT (...)`
    pub fn conflict_columns(&self) -> String {
        self.conflict_keys
            .iter()
            .map(ConflictKey::column)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn unique_index_name(&self) -> String {
        let cols = self
            .conflict_keys
            .iter()
            .map(ConflictKey::column)
            .collect::<Vec<_>>()
            .join("_");
        format!("uq_{}_{}", self.name, cols)
    }
}

/// Validated table names for one source prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTables {
    prefix: String,
    work_queue: String,
    snapshots: String,
    results: ResultTable,
}

impl SourceTables {
    /// Default result dedup key: the same content for the same item is one row,
    /// whichever run produced it.
    pub const DEFAULT_CONFLICT_KEYS: [ConflictKey; 2] =
        [ConflictKey::ItemKey, ConflictKey::ContentHash];

    pub fn new(prefix: &str) -> EngineResult<Self> {
        if !PREFIX_PATTERN.is_match(prefix) {
            return Err(EngineError::InvalidIdentifier(prefix.to_string()));
        }

        Ok(Self {
            prefix: prefix.to_string(),
            work_queue: format!("{prefix}_work_queue"),
            snapshots: format!("{prefix}_progress_snapshots"),
            results: ResultTable {
                name: format!("{prefix}_results"),
                conflict_keys: Self::DEFAULT_CONFLICT_KEYS.to_vec(),
            },
        })
    }

    /// Override the result table's natural key. Must be non-empty.
    pub fn with_conflict_keys(mut self, keys: &[ConflictKey]) -> EngineResult<Self> {
        if keys.is_empty() {
            return Err(EngineError::config("result conflict keys cannot be empty"));
        }
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(key) {
                unique.push(*key);
            }
        }
        self.results.conflict_keys = unique;
        Ok(self)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn work_queue(&self) -> &str {
        &self.work_queue
    }

    pub fn snapshots(&self) -> &str {
        &self.snapshots
    }

    pub fn results(&self) -> &ResultTable {
        &self.results
    }

    /// Create the source's tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self, pool: &PgPool) -> EngineResult<()> {
        let mut tx = pool.begin().await?;

        // Serialize concurrent DDL for the same prefix across processes
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.prefix)
            .execute(&mut *tx)
            .await?;

        for statement in self.schema_statements() {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;

        tracing::debug!(prefix = %self.prefix, "Source tables ensured");
        Ok(())
    }

    fn schema_statements(&self) -> Vec<String> {
        let queue = &self.work_queue;
        let snapshots = &self.snapshots;
        let results = &self.results.name;

        vec![
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {queue} (
                    seq          BIGSERIAL PRIMARY KEY,
                    run_id       TEXT NOT NULL,
                    item_key     TEXT NOT NULL,
                    status       TEXT NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'in_progress', 'completed', 'failed', 'zero_result')),
                    claimed_by   TEXT,
                    claimed_at   TIMESTAMPTZ,
                    attempts     INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
                    last_error   TEXT,
                    started_at   TIMESTAMPTZ,
                    completed_at TIMESTAMPTZ,
                    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (run_id, item_key),
                    CHECK ((status = 'in_progress') = (claimed_by IS NOT NULL)),
                    CHECK ((status = 'in_progress') = (claimed_at IS NOT NULL))
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{queue}_claim ON {queue} (run_id, status, seq)"
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {snapshots} (
                    id           BIGSERIAL PRIMARY KEY,
                    run_id       TEXT NOT NULL,
                    pending      BIGINT NOT NULL,
                    in_progress  BIGINT NOT NULL,
                    completed    BIGINT NOT NULL,
                    failed       BIGINT NOT NULL,
                    zero_result  BIGINT NOT NULL,
                    rate_per_min DOUBLE PRECISION NOT NULL,
                    eta_seconds  DOUBLE PRECISION,
                    recorded_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{snapshots}_run ON {snapshots} (run_id, recorded_at DESC)"
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {results} (
                    id           BIGSERIAL PRIMARY KEY,
                    run_id       TEXT NOT NULL,
                    last_run_id  TEXT NOT NULL,
                    item_key     TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    payload      JSONB NOT NULL,
                    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {results} ({})",
                self.results.unique_index_name(),
                self.results.conflict_columns()
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{results}_item ON {results} (item_key)"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{results}_runs ON {results} (run_id, last_run_id)"
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_prefix() {
        let tables = SourceTables::new("pharma_de").unwrap();
        assert_eq!(tables.work_queue(), "pharma_de_work_queue");
        assert_eq!(tables.snapshots(), "pharma_de_progress_snapshots");
        assert_eq!(tables.results().name, "pharma_de_results");
        assert_eq!(tables.results().conflict_columns(), "item_key, content_hash");
    }

    #[test]
    fn test_rejects_unsafe_prefixes() {
        for bad in ["", "1abc", "Drop", "a;drop table x", "a-b", "abcdefghijklmnopqrstuvwxyz"] {
            assert!(
                matches!(SourceTables::new(bad), Err(EngineError::InvalidIdentifier(_))),
                "prefix {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_conflict_key_override() {
        let tables = SourceTables::new("src")
            .unwrap()
            .with_conflict_keys(&[ConflictKey::RunId, ConflictKey::ContentHash, ConflictKey::RunId])
            .unwrap();
        assert_eq!(tables.results().conflict_columns(), "run_id, content_hash");
        assert_eq!(tables.results().unique_index_name(), "uq_src_results_run_id_content_hash");

        assert!(SourceTables::new("src").unwrap().with_conflict_keys(&[]).is_err());
    }

    #[test]
    fn test_schema_mentions_claim_invariant() {
        let tables = SourceTables::new("src").unwrap();
        let ddl = tables.schema_statements().join("\n");
        assert!(ddl.contains("UNIQUE (run_id, item_key)"));
        assert!(ddl.contains("(status = 'in_progress') = (claimed_by IS NOT NULL)"));
    }
}
