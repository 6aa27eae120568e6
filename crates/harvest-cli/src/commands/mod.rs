//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function returning the
//! process exit code.

pub mod control;
pub mod demo;
pub mod migrate;
pub mod recover;
pub mod retry;
pub mod status;

use anyhow::{Context, Result};
use harvest_engine::db::{create_pool, health_check, DbConfig};
use sqlx::PgPool;

/// Pool from `DATABASE_URL` and `DB_*`, large enough for `workers` workers.
pub(crate) async fn connect(workers: usize) -> Result<PgPool> {
    let config = DbConfig::from_env()
        .context("Database configuration")?
        .sized_for_workers(workers);
    let pool = create_pool(&config).await.context("Connecting to database")?;
    health_check(&pool).await.context("Database health check")?;
    Ok(pool)
}
