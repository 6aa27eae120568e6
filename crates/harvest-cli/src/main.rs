//! Harvest CLI - Main entry point

use std::process::ExitCode;

use clap::Parser;
use harvest_cli::commands::{self, demo::DemoOptions, retry::RetryOptions};
use harvest_cli::{Cli, Commands};
use harvest_common::logging::{init_logging, LogConfig, LogLevel};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();

    let log_config = LogConfig {
        level: if cli.verbose { LogLevel::Debug } else { LogLevel::Info },
        log_file_prefix: "harvest".to_string(),
        ..LogConfig::default()
    };

    // Environment variables take precedence
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e}");
            None
        },
    };

    match execute_command(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Execute the CLI command
async fn execute_command(command: Commands) -> anyhow::Result<u8> {
    match command {
        Commands::Migrate => commands::migrate::run().await,

        Commands::Recover { scraper } => commands::recover::run(scraper.as_deref()).await,

        Commands::Status {
            run_id,
            scraper,
            prefix,
            limit,
        } => {
            commands::status::run(run_id.as_deref(), scraper.as_deref(), prefix.as_deref(), limit)
                .await
        },

        Commands::Stop { run_id } => commands::control::stop(&run_id).await,

        Commands::Cancel { run_id } => commands::control::cancel(&run_id).await,

        Commands::Retry {
            run_id,
            prefix,
            include_exhausted,
            zero_results,
            items,
        } => {
            let options = RetryOptions {
                include_exhausted,
                zero_results,
                items,
            };
            commands::retry::run(&run_id, &prefix, options).await
        },

        Commands::Demo {
            items,
            workers,
            fail_rate,
            zero_rate,
            delay_ms,
            seed,
            prefix,
            attach,
        } => {
            commands::demo::run(DemoOptions {
                items,
                workers,
                fail_rate,
                zero_rate,
                delay_ms,
                seed,
                prefix,
                attach,
            })
            .await
        },
    }
}
