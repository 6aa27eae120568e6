//! `harvest stop` and `harvest cancel` command implementations
//!
//! Both close an open run from outside the process working it. That process
//! notices within `HARVEST_IDLE_POLL_SECS`, releases the claims it has not
//! started and exits; its own finalize then leaves the closed status alone.

use anyhow::{bail, Context, Result};
use harvest_engine::ledger::LedgerStore;
use harvest_engine::RunStatus;

use super::connect;

pub async fn stop(run_id: &str) -> Result<u8> {
    close(run_id, RunStatus::Stopped).await
}

pub async fn cancel(run_id: &str) -> Result<u8> {
    close(run_id, RunStatus::Cancelled).await
}

async fn close(run_id: &str, status: RunStatus) -> Result<u8> {
    let ledger = LedgerStore::new(connect(0).await?);

    let changed = match status {
        RunStatus::Cancelled => ledger.cancel(run_id).await,
        _ => ledger.mark_stopped(run_id).await,
    }
    .with_context(|| format!("Closing run {run_id}"))?;

    if changed {
        println!("Run {run_id} is now {status}.");
        return Ok(0);
    }

    match ledger.get(run_id).await? {
        Some(run) => {
            println!("Run {run_id} was already {}; nothing changed.", run.status);
            Ok(0)
        },
        None => bail!("run {run_id} not found"),
    }
}
