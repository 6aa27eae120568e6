//! `harvest demo` command implementation
//!
//! Drives a complete run against [`SyntheticSource`]. Run it twice with the
//! same prefix after interrupting the first to watch a resume; run it with
//! `--attach <RUN_ID>` from a second terminal to add workers to a live run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use harvest_engine::config::HarvestConfig;
use harvest_engine::coordinator::{Coordinator, PipelineContext, RunSummary};
use harvest_engine::db::run_migrations;
use harvest_engine::shutdown::cancel_on_signal;
use harvest_engine::tables::SourceTables;
use harvest_engine::testing::SyntheticSource;
use tokio_util::sync::CancellationToken;

use super::connect;

/// Options of one demo invocation
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub items: usize,
    pub workers: Option<usize>,
    pub fail_rate: f64,
    pub zero_rate: f64,
    pub delay_ms: u64,
    pub seed: u64,
    pub prefix: String,
    pub attach: Option<String>,
}

/// Item keys of the demo input: `item-00000`, `item-00001`, ...
pub fn demo_keys(items: usize) -> Vec<String> {
    (0..items).map(|i| format!("item-{i:05}")).collect()
}

pub async fn run(options: DemoOptions) -> Result<u8> {
    let mut config = HarvestConfig::from_env().context("Loading harvest configuration")?;
    if let Some(workers) = options.workers {
        config.worker_count = workers;
    }
    config.validate()?;

    let tables = SourceTables::new(&options.prefix)?;
    let pool = connect(config.worker_count).await?;
    run_migrations(&pool).await.context("Applying migrations")?;

    let mut source = SyntheticSource::new(options.prefix.clone())
        .with_seed(options.seed)
        .with_fail_rate(options.fail_rate)
        .with_zero_rate(options.zero_rate);
    if options.delay_ms > 0 {
        source = source.with_delay(Duration::from_millis(options.delay_ms));
    }

    let ctx = PipelineContext::new(pool, config, tables, Arc::new(source));
    let coordinator = Coordinator::new(ctx);

    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());

    let code = match options.attach {
        Some(ref run_id) => {
            coordinator.context().tables.ensure_schema(&coordinator.context().pool).await?;
            let report = coordinator.attach(run_id, cancel.clone()).await?;
            println!(
                "Attached to {run_id}: {} completed, {} zero-result, {} failed, {} lost claim(s)",
                report.stats.completed, report.stats.zero_result, report.stats.failed, report.stats.lost_claims
            );
            report.exit_code()
        },
        None => {
            let handle = coordinator.prepare(&demo_keys(options.items)).await?;
            println!("{} run {} ({})", "Starting".green().bold(), handle.run_id, handle.mode);
            let summary = coordinator.run(&handle, cancel.clone()).await?;
            print_summary(&summary);
            summary.exit_code()
        },
    };

    cancel.cancel();
    let _ = signals.await;

    Ok(code)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run summary:".cyan().bold());
    println!("  Run:      {}", summary.run_id);
    println!("  Status:   {}", summary.status);
    if let Some(ref counts) = summary.counts {
        println!(
            "  Items:    {} completed, {} zero-result, {} failed, {} remaining",
            counts.completed,
            counts.zero_result,
            counts.failed,
            counts.remaining()
        );
    }
    println!("  Exported: {}", summary.items_exported);
    if !summary.permanent_failures.is_empty() {
        println!("  {}", "Permanent failures:".red());
        for failure in summary.permanent_failures.iter().take(20) {
            println!(
                "    {} ({} attempts): {}",
                failure.item_key,
                failure.attempts,
                failure.last_error.as_deref().unwrap_or("-")
            );
        }
    }
    if summary.worker_failures > 0 {
        println!("  {} {}", "Worker failures:".red(), summary.worker_failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_keys_are_stable_and_sortable() {
        let keys = demo_keys(3);
        assert_eq!(keys, vec!["item-00000", "item-00001", "item-00002"]);

        let mut sorted = demo_keys(1000);
        sorted.sort();
        assert_eq!(sorted, demo_keys(1000));
    }
}
