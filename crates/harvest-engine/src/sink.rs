//! Result sink
//!
//! The only writer of `<prefix>_results`. Rows are upserted on the table's
//! conflict keys, so writing the same result any number of times, from any
//! run, leaves exactly one row.

use harvest_common::hashing::{content_hash, DEFAULT_VOLATILE_FIELDS};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{HashMap, HashSet};

use crate::error::EngineResult;
use crate::queue::DEFAULT_CHUNK_SIZE;
use crate::tables::{ConflictKey, ResultTable};
use crate::types::ResultRecord;

/// Content hash of a result row with the default volatile fields excluded.
///
/// With `keys`, only those fields are hashed.
pub fn compute_hash(row: &Value, keys: Option<&[&str]>) -> String {
    content_hash(row, keys, DEFAULT_VOLATILE_FIELDS)
}

#[derive(Debug, Clone)]
pub struct ResultSink {
    pool: PgPool,
    chunk_size: usize,
}

impl ResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Insert or update `rows` on the table's conflict keys.
    ///
    /// Returns the number of rows written (inserted or updated).
    pub async fn upsert_batch(&self, table: &ResultTable, rows: &[ResultRecord]) -> EngineResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        // One statement cannot update the same target row twice
        let rows = dedup_on_conflict_keys(rows, &table.conflict_keys);
        let mut written = 0;

        for chunk in rows.chunks(self.chunk_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (run_id, last_run_id, item_key, content_hash, payload) ",
                table.name
            ));

            builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.run_id)
                    .push_bind(&row.run_id)
                    .push_bind(&row.item_key)
                    .push_bind(&row.content_hash)
                    .push_bind(&row.payload);
            });

            builder.push(format!(
                r#"
                ON CONFLICT ({}) DO UPDATE SET
                    payload = EXCLUDED.payload,
                    last_run_id = EXCLUDED.last_run_id,
                    updated_at = NOW()
                "#,
                table.conflict_columns()
            ));

            written += builder.build().execute(&self.pool).await?.rows_affected();
        }

        tracing::debug!(table = %table.name, rows = rows.len(), written, "Upserted results");
        Ok(written)
    }

    /// Distinct item keys with at least one stored result, across all runs
    pub async fn materialized_keys(&self, table: &ResultTable) -> EngineResult<HashSet<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar(&format!("SELECT DISTINCT item_key FROM {}", table.name))
                .fetch_all(&self.pool)
                .await?;

        Ok(keys.into_iter().collect())
    }

    /// Rows first written or last refreshed by `run_id`
    pub async fn count_for_run(&self, table: &ResultTable, run_id: &str) -> EngineResult<i64> {
        let count = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE run_id = $1 OR last_run_id = $1",
            table.name
        ))
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn rows_for_item(&self, table: &ResultTable, item_key: &str) -> EngineResult<Vec<ResultRecord>> {
        let rows: Vec<(String, String, String, Value)> = sqlx::query_as(&format!(
            "SELECT run_id, item_key, content_hash, payload FROM {} WHERE item_key = $1 ORDER BY id",
            table.name
        ))
        .bind(item_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(run_id, item_key, content_hash, payload)| ResultRecord {
                run_id,
                item_key,
                content_hash,
                payload,
            })
            .collect())
    }
}

/// Collapse rows sharing a conflict key; the last occurrence wins and keeps
/// the position of the first.
fn dedup_on_conflict_keys(rows: &[ResultRecord], keys: &[ConflictKey]) -> Vec<ResultRecord> {
    let mut position: HashMap<Vec<&str>, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<ResultRecord> = Vec::with_capacity(rows.len());

    for row in rows {
        let key: Vec<&str> = keys
            .iter()
            .map(|k| match k {
                ConflictKey::RunId => row.run_id.as_str(),
                ConflictKey::ItemKey => row.item_key.as_str(),
                ConflictKey::ContentHash => row.content_hash.as_str(),
            })
            .collect();

        match position.get(&key) {
            Some(&idx) => out[idx] = row.clone(),
            None => {
                position.insert(key, out.len());
                out.push(row.clone());
            },
        }
    }

    out
}
