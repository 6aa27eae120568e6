//! Harvest CLI Library
//!
//! Operator commands for the Harvest scrape engine.
//!
//! # Overview
//!
//! - **Schema**: apply `run_ledger` migrations (`harvest migrate`)
//! - **Recovery**: normalize runs left open by a crash (`harvest recover`)
//! - **Inspection**: ledger rows, queue counts, latest snapshot (`harvest status`)
//! - **Control**: close runs (`harvest stop`, `harvest cancel`) and reopen them
//!   for another pass over failed items (`harvest retry`)
//! - **Demo**: drive a full run against the synthetic source (`harvest demo`)

pub mod commands;

use clap::{Parser, Subcommand};

/// Harvest - resumable scrape runs over PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Normalize open runs after an unclean shutdown
    Recover {
        /// Only recover runs of this scraper
        #[arg(short, long)]
        scraper: Option<String>,
    },

    /// Show recent runs, or one run in detail
    Status {
        /// Run to inspect
        #[arg(short, long)]
        run_id: Option<String>,

        /// Only list runs of this scraper
        #[arg(short, long)]
        scraper: Option<String>,

        /// Table prefix of the source, for queue counts and snapshots
        #[arg(short, long)]
        prefix: Option<String>,

        /// Number of runs to list
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },

    /// Close an open run as stopped
    Stop {
        /// Run to stop
        run_id: String,
    },

    /// Close an open run as cancelled
    Cancel {
        /// Run to cancel
        run_id: String,
    },

    /// Reopen a run and requeue its failed items
    Retry {
        /// Run to reopen
        run_id: String,

        /// Table prefix of the source
        #[arg(short, long)]
        prefix: String,

        /// Also requeue items that used up their attempts
        #[arg(long)]
        include_exhausted: bool,

        /// Also requeue zero-result items
        #[arg(long)]
        zero_results: bool,

        /// Requeue this key whatever its status (repeatable)
        #[arg(long = "item", value_name = "KEY")]
        items: Vec<String>,
    },

    /// Run the engine against a synthetic source
    Demo {
        /// Number of items to seed
        #[arg(short, long, default_value_t = 100)]
        items: usize,

        /// Workers in this process (overrides HARVEST_WORKER_COUNT)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Fraction of fetches that fail transiently
        #[arg(long, default_value_t = 0.05)]
        fail_rate: f64,

        /// Fraction of fetches that return nothing
        #[arg(long, default_value_t = 0.0)]
        zero_rate: f64,

        /// Delay per fetch in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,

        /// Seed for the synthetic failure pattern
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Table prefix, also used as the scraper name
        #[arg(short, long, default_value = "demo")]
        prefix: String,

        /// Join an open run as extra workers instead of owning one
        #[arg(long)]
        attach: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_accepts_repeated_items() {
        let cli = Cli::try_parse_from([
            "harvest", "retry", "run-1", "--prefix", "demo", "--item", "item-001", "--item", "item-007",
        ])
        .unwrap();

        match cli.command {
            Commands::Retry {
                run_id,
                prefix,
                include_exhausted,
                items,
                ..
            } => {
                assert_eq!(run_id, "run-1");
                assert_eq!(prefix, "demo");
                assert!(!include_exhausted);
                assert_eq!(items, vec!["item-001", "item-007"]);
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
