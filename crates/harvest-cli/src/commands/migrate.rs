//! `harvest migrate` command implementation

use anyhow::{Context, Result};
use harvest_engine::db::run_migrations;

use super::connect;

pub async fn run() -> Result<u8> {
    let pool = connect(0).await?;
    run_migrations(&pool).await.context("Applying migrations")?;
    println!("Migrations applied.");
    Ok(0)
}
