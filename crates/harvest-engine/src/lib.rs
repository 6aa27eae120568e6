//! Harvest Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
//!
//! Resumable, distributed scrape work queue over PostgreSQL.
//!
//! # Overview
//!
//! Any number of worker processes share one database. All coordination is
//! transactional row state; there is no broker and no in-memory leader.
//!
//! - **Run Ledger**: one `run_ledger` row per run, at most one resumable run per scraper
//! - **Work Queue**: `<prefix>_work_queue`, claimed with `FOR UPDATE SKIP LOCKED`
//! - **Reclaimer**: returns abandoned claims to pending
//! - **Retry Policy**: bounded retries, one zero-result recheck per run
//! - **Progress Reporter**: throughput/ETA lines and `<prefix>_progress_snapshots`
//! - **Result Sink**: idempotent upserts into `<prefix>_results`
//! - **Coordinator**: fresh start or resume, worker pool, exactly-once finalize
//! - **Status Watcher**: stops local workers when the run is stopped or cancelled elsewhere
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use harvest_engine::{
//!     config::HarvestConfig, coordinator::{Coordinator, PipelineContext}, db,
//!     tables::SourceTables, testing::SyntheticSource,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = db::create_pool(&db::DbConfig::from_env()?).await?;
//! db::run_migrations(&pool).await?;
//!
//! let ctx = PipelineContext::new(
//!     pool,
//!     HarvestConfig::from_env()?,
//!     SourceTables::new("demo")?,
//!     Arc::new(SyntheticSource::new("demo")),
//! );
//! let coordinator = Coordinator::new(ctx);
//!
//! let keys: Vec<String> = (0..100).map(|i| format!("item-{i}")).collect();
//! let handle = coordinator.prepare(&keys).await?;
//! let summary = coordinator.run(&handle, CancellationToken::new()).await?;
//! std::process::exit(summary.exit_code().into());
//! # }
//! ```

pub mod best_effort;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod queue;
pub mod reclaim;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod tables;
pub mod testing;
pub mod types;
pub mod watch;
pub mod worker;

// Re-export commonly used types
pub use coordinator::{Coordinator, PipelineContext, RunHandle, RunSummary};
pub use error::{EngineError, EngineResult};
pub use source::ScrapeSource;
pub use types::{ItemStatus, Outcome, QueueCounts, ResultRecord, RunMode, RunRecord, RunStatus};
