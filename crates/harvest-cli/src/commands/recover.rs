//! `harvest recover` command implementation
//!
//! Leaves the newest open run of each scraper resumable and stops the rest.

use anyhow::{Context, Result};
use colored::Colorize;
use harvest_engine::ledger::LedgerStore;

use super::connect;

pub async fn run(scraper: Option<&str>) -> Result<u8> {
    let pool = connect(0).await?;
    let report = LedgerStore::new(pool)
        .recover_on_startup(scraper)
        .await
        .context("Recovering open runs")?;

    if report.resumable.is_empty() && report.stopped.is_empty() {
        println!("No open runs.");
        return Ok(0);
    }

    for run_id in &report.resumable {
        println!("{} {}", "resume ".green(), run_id);
    }
    for run_id in &report.stopped {
        println!("{} {}", "stopped".yellow(), run_id);
    }

    Ok(0)
}
