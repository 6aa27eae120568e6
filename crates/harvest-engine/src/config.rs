//! Engine configuration
//!
//! Loaded from `HARVEST_*` environment variables (after `.env`, via dotenvy)
//! on top of the defaults below, then validated.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

// ============================================================================
// Defaults
// ============================================================================

/// Default workers per process.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default claim batch size.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default age after which an in-progress claim counts as abandoned.
pub const DEFAULT_STALE_CLAIM_MINUTES: u64 = 30;

/// Default reclaimer sweep interval in seconds.
pub const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 60;

/// Default attempt budget for failed items.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Default progress line interval in seconds.
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 30;

/// Default snapshot interval in seconds (5 minutes).
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 300;

/// Default claim heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Default wait while other processes still hold claims.
pub const DEFAULT_IDLE_POLL_SECS: u64 = 5;

/// Default rows per multi-row INSERT.
pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 500;

/// Runtime settings for a pipeline process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub stale_claim_minutes: u64,
    pub reclaim_interval_secs: u64,
    pub max_attempts: i32,
    pub progress_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub idle_poll_secs: u64,
    pub upsert_chunk_size: usize,
    /// Allow the one-shot zero-result recheck
    pub zero_result_recheck: bool,
    /// Interrupted runs end as `resume` rather than `partial`
    pub resume_on_interrupt: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            stale_claim_minutes: DEFAULT_STALE_CLAIM_MINUTES,
            reclaim_interval_secs: DEFAULT_RECLAIM_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            progress_interval_secs: DEFAULT_PROGRESS_INTERVAL_SECS,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            idle_poll_secs: DEFAULT_IDLE_POLL_SECS,
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
            zero_result_recheck: true,
            resume_on_interrupt: true,
        }
    }
}

impl HarvestConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> EngineResult<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            worker_count: env_or("HARVEST_WORKER_COUNT", defaults.worker_count)?,
            batch_size: env_or("HARVEST_BATCH_SIZE", defaults.batch_size)?,
            stale_claim_minutes: env_or("HARVEST_STALE_CLAIM_MINUTES", defaults.stale_claim_minutes)?,
            reclaim_interval_secs: env_or(
                "HARVEST_RECLAIM_INTERVAL_SECS",
                defaults.reclaim_interval_secs,
            )?,
            max_attempts: env_or("HARVEST_MAX_ATTEMPTS", defaults.max_attempts)?,
            progress_interval_secs: env_or(
                "HARVEST_PROGRESS_INTERVAL_SECS",
                defaults.progress_interval_secs,
            )?,
            snapshot_interval_secs: env_or(
                "HARVEST_SNAPSHOT_INTERVAL_SECS",
                defaults.snapshot_interval_secs,
            )?,
            heartbeat_interval_secs: env_or(
                "HARVEST_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            idle_poll_secs: env_or("HARVEST_IDLE_POLL_SECS", defaults.idle_poll_secs)?,
            upsert_chunk_size: env_or("HARVEST_UPSERT_CHUNK_SIZE", defaults.upsert_chunk_size)?,
            zero_result_recheck: env_or("HARVEST_ZERO_RESULT_RECHECK", defaults.zero_result_recheck)?,
            resume_on_interrupt: env_or(
                "HARVEST_RESUME_ON_INTERRUPT",
                defaults.resume_on_interrupt,
            )?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.worker_count == 0 {
            return Err(EngineError::config("worker_count must be greater than 0"));
        }

        if self.batch_size == 0 {
            return Err(EngineError::config("batch_size must be greater than 0"));
        }

        if self.max_attempts <= 0 {
            return Err(EngineError::config("max_attempts must be greater than 0"));
        }

        if self.upsert_chunk_size == 0 {
            return Err(EngineError::config("upsert_chunk_size must be greater than 0"));
        }

        for (name, value) in [
            ("stale_claim_minutes", self.stale_claim_minutes),
            ("reclaim_interval_secs", self.reclaim_interval_secs),
            ("progress_interval_secs", self.progress_interval_secs),
            ("snapshot_interval_secs", self.snapshot_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("idle_poll_secs", self.idle_poll_secs),
        ] {
            if value == 0 {
                return Err(EngineError::config(format!("{name} must be greater than 0")));
            }
        }

        if self.snapshot_interval_secs < self.progress_interval_secs {
            return Err(EngineError::config(format!(
                "snapshot_interval_secs ({}) cannot be shorter than progress_interval_secs ({})",
                self.snapshot_interval_secs, self.progress_interval_secs
            )));
        }

        let stale_claim_secs = self.stale_claim_minutes.checked_mul(60).ok_or_else(|| {
            EngineError::config(format!(
                "stale_claim_minutes ({}) is too large",
                self.stale_claim_minutes
            ))
        })?;

        // A heartbeat slower than the stale threshold lets live claims be reclaimed
        if self.heartbeat_interval_secs >= stale_claim_secs {
            tracing::warn!(
                heartbeat_interval_secs = self.heartbeat_interval_secs,
                stale_claim_minutes = self.stale_claim_minutes,
                "Heartbeat interval is not shorter than the stale-claim threshold"
            );
        }

        Ok(())
    }

    pub fn stale_claim_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_claim_minutes.saturating_mul(60))
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.idle_poll_secs)
    }
}

fn env_or<T>(name: &str, default: T) -> EngineResult<T>
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::config(format!("{name}={raw:?} could not be parsed"))),
        Err(_) => Ok(default),
    }
}
