//! Test helpers for Harvest engine integration tests
//!
//! Every test gets a fresh database from `#[sqlx::test]` with the
//! `run_ledger` migration applied; these helpers create the per-source tables
//! and build contexts with short intervals.
#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use harvest_engine::config::HarvestConfig;
use harvest_engine::coordinator::PipelineContext;
use harvest_engine::source::ScrapeSource;
use harvest_engine::tables::SourceTables;
use sqlx::PgPool;

static TRACING: Once = Once::new();

/// Route engine logs to the test writer; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("harvest_engine=info")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// `count` item keys: item-000, item-001, ...
pub fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("item-{i:03}")).collect()
}

/// Defaults with intervals short enough for tests
pub fn fast_config() -> HarvestConfig {
    HarvestConfig {
        worker_count: 4,
        batch_size: 10,
        progress_interval_secs: 1,
        snapshot_interval_secs: 1,
        heartbeat_interval_secs: 1,
        reclaim_interval_secs: 1,
        idle_poll_secs: 1,
        ..HarvestConfig::default()
    }
}

pub async fn tables(pool: &PgPool, prefix: &str) -> SourceTables {
    let tables = SourceTables::new(prefix).expect("valid prefix");
    tables.ensure_schema(pool).await.expect("schema");
    tables
}

pub async fn context(
    pool: &PgPool,
    prefix: &str,
    config: HarvestConfig,
    source: Arc<dyn ScrapeSource>,
) -> PipelineContext {
    let tables = tables(pool, prefix).await;
    PipelineContext::new(pool.clone(), config, tables, source)
}

/// Backdate every in-progress claim of the run by `age`.
pub async fn age_claims(pool: &PgPool, tables: &SourceTables, run_id: &str, age: Duration) {
    sqlx::query(&format!(
        "UPDATE {} SET claimed_at = claimed_at - $2::bigint * INTERVAL '1 second' \
         WHERE run_id = $1 AND status = 'in_progress'",
        tables.work_queue()
    ))
    .bind(run_id)
    .bind(age.as_secs() as i64)
    .execute(pool)
    .await
    .expect("age claims");
}

/// Count result rows for one item key
pub async fn result_rows_for(pool: &PgPool, tables: &SourceTables, item_key: &str) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {} WHERE item_key = $1",
        tables.results().name
    ))
    .bind(item_key)
    .fetch_one(pool)
    .await
    .expect("count results")
}

/// Number of (item_key, content_hash) pairs stored more than once
pub async fn duplicate_results(pool: &PgPool, tables: &SourceTables) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM (SELECT item_key, content_hash FROM {} \
         GROUP BY item_key, content_hash HAVING COUNT(*) > 1) d",
        tables.results().name
    ))
    .fetch_one(pool)
    .await
    .expect("duplicate check")
}
