//! `harvest status` command implementation
//!
//! Lists recent runs, or shows one run with its queue counts and the latest
//! progress snapshot when the source prefix is given.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use harvest_engine::ledger::LedgerStore;
use harvest_engine::progress::latest_snapshot;
use harvest_engine::queue::WorkQueue;
use harvest_engine::tables::SourceTables;
use harvest_engine::{RunRecord, RunStatus};

use super::connect;

pub async fn run(
    run_id: Option<&str>,
    scraper: Option<&str>,
    prefix: Option<&str>,
    limit: i64,
) -> Result<u8> {
    let pool = connect(0).await?;
    let ledger = LedgerStore::new(pool.clone());

    let Some(run_id) = run_id else {
        let runs = ledger.list_recent(scraper, limit).await.context("Listing runs")?;
        if runs.is_empty() {
            println!("No runs found.");
            return Ok(0);
        }
        for run in &runs {
            println!(
                "{:<38} {:<20} {} {:>8} scraped {:>8} exported  {}",
                run.run_id,
                run.scraper_name,
                colored_status(run.status),
                run.items_scraped,
                run.items_exported,
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
            );
        }
        return Ok(0);
    };

    let Some(run) = ledger.get(run_id).await? else {
        bail!("run {run_id} not found");
    };
    print_run(&run);

    if let Some(prefix) = prefix {
        let tables = SourceTables::new(prefix)?;
        let counts = WorkQueue::new(pool.clone(), &tables)
            .counts(run_id)
            .await
            .context("Reading queue counts")?;

        println!();
        println!("{}", "Queue:".cyan().bold());
        println!("  Pending:     {}", counts.pending);
        println!("  In progress: {}", counts.in_progress);
        println!("  Completed:   {}", counts.completed);
        println!("  Zero result: {}", counts.zero_result);
        println!("  Failed:      {}", counts.failed);

        if let Some(snapshot) = latest_snapshot(&pool, &tables, run_id).await? {
            println!();
            println!("{}", "Last snapshot:".cyan().bold());
            println!("  Recorded: {}", snapshot.recorded_at);
            println!("  Rate:     {:.1}/min", snapshot.rate_per_min);
            match snapshot.eta_seconds {
                Some(eta) => println!("  ETA:      {:.0}s", eta),
                None => println!("  ETA:      unknown"),
            }
        }
    }

    Ok(0)
}

fn print_run(run: &RunRecord) {
    println!("{}", run.run_id.green());
    println!("  Scraper:  {}", run.scraper_name);
    println!("  Status:   {}", colored_status(run.status));
    println!("  Mode:     {}", run.mode);
    println!("  Started:  {}", run.started_at);
    if let Some(ended_at) = run.ended_at {
        println!("  Ended:    {}", ended_at);
    }
    println!("  Scraped:  {}", run.items_scraped);
    println!("  Exported: {}", run.items_exported);
    if let Some(ref error) = run.error_message {
        println!("  Error:    {}", error.red());
    }
    if !run.totals.is_null() && run.totals != serde_json::json!({}) {
        println!("  Totals:   {}", run.totals);
    }
}

fn colored_status(status: RunStatus) -> colored::ColoredString {
    let label = format!("{:<9}", status.as_str());
    match status {
        RunStatus::Completed => label.green(),
        RunStatus::Running | RunStatus::Resume => label.cyan(),
        RunStatus::Partial | RunStatus::Stopped => label.yellow(),
        RunStatus::Failed | RunStatus::Cancelled => label.red(),
    }
}
