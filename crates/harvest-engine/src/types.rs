//! Core types for the run ledger, work queue and result tables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};

/// Lifecycle status of a run (maps to `run_ledger.status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Resume,
    Partial,
    Completed,
    Failed,
    Cancelled,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Resume => "resume",
            RunStatus::Partial => "partial",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Stopped => "stopped",
        }
    }

    /// `running` and `resume` rows may still be continued.
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Resume)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_resumable()
    }
}

impl FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "resume" => Ok(RunStatus::Resume),
            "partial" => Ok(RunStatus::Partial),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "stopped" => Ok(RunStatus::Stopped),
            other => Err(EngineError::unknown("run status", other)),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run was entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Fresh,
    Resume,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Fresh => "fresh",
            RunMode::Resume => "resume",
        }
    }
}

impl FromStr for RunMode {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "fresh" => Ok(RunMode::Fresh),
            "resume" => Ok(RunMode::Resume),
            other => Err(EngineError::unknown("run mode", other)),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item status (maps to `<prefix>_work_queue.status`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    ZeroResult,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::ZeroResult => "zero_result",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> EngineResult<Self> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "in_progress" => Ok(ItemStatus::InProgress),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            "zero_result" => Ok(ItemStatus::ZeroResult),
            other => Err(EngineError::unknown("item status", other)),
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline execution (maps to `run_ledger`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub scraper_name: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_scraped: i64,
    pub items_exported: i64,
    pub error_message: Option<String>,
    /// Opaque per-run counters
    pub totals: serde_json::Value,
    pub zero_result_rechecked: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub run_id: String,
    pub scraper_name: String,
    pub status: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub items_scraped: i64,
    pub items_exported: i64,
    pub error_message: Option<String>,
    pub totals_json: serde_json::Value,
    pub zero_result_rechecked: bool,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = EngineError;

    fn try_from(row: RunRow) -> EngineResult<Self> {
        Ok(Self {
            status: row.status.parse()?,
            mode: row.mode.parse()?,
            run_id: row.run_id,
            scraper_name: row.scraper_name,
            started_at: row.started_at,
            ended_at: row.ended_at,
            items_scraped: row.items_scraped,
            items_exported: row.items_exported,
            error_message: row.error_message,
            totals: row.totals_json,
            zero_result_rechecked: row.zero_result_rechecked,
        })
    }
}

/// One unit of work scoped to a run (maps to `<prefix>_work_queue`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub seq: i64,
    pub run_id: String,
    pub item_key: String,
    pub status: ItemStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkItemRow {
    pub seq: i64,
    pub run_id: String,
    pub item_key: String,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = EngineError;

    fn try_from(row: WorkItemRow) -> EngineResult<Self> {
        Ok(Self {
            status: row.status.parse()?,
            seq: row.seq,
            run_id: row.run_id,
            item_key: row.item_key,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            attempts: row.attempts,
            last_error: row.last_error,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

/// A work item handed to a worker by `claim_batch`
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ClaimedItem {
    pub seq: i64,
    pub item_key: String,
    pub attempts: i32,
}

/// Outcome a worker reports for a claimed item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// At least one meaningful result row was written
    Completed { result_count: usize },
    /// The source answered well-formed but had no usable data
    ZeroResult,
    /// Fetch or write failed; recorded as `last_error`
    Failed { error: String },
}

impl Outcome {
    pub fn status(&self) -> ItemStatus {
        match self {
            Outcome::Completed { .. } => ItemStatus::Completed,
            Outcome::ZeroResult => ItemStatus::ZeroResult,
            Outcome::Failed { .. } => ItemStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// A normalized result row (maps to `<prefix>_results`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub run_id: String,
    pub item_key: String,
    pub content_hash: String,
    /// Source-specific row contents
    pub payload: serde_json::Value,
}

/// Aggregate work queue counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub zero_result: i64,
}

impl QueueCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.in_progress + self.completed + self.failed + self.zero_result
    }

    /// Items still waiting for or undergoing processing
    pub fn remaining(&self) -> i64 {
        self.pending + self.in_progress
    }

    /// Items with an outcome recorded (including failures awaiting retry)
    pub fn done(&self) -> i64 {
        self.completed + self.failed + self.zero_result
    }

    /// Items that finished without error
    pub fn scraped(&self) -> i64 {
        self.completed + self.zero_result
    }

    pub(crate) fn add(&mut self, status: ItemStatus, count: i64) {
        match status {
            ItemStatus::Pending => self.pending += count,
            ItemStatus::InProgress => self.in_progress += count,
            ItemStatus::Completed => self.completed += count,
            ItemStatus::Failed => self.failed += count,
            ItemStatus::ZeroResult => self.zero_result += count,
        }
    }
}

/// Periodic sample of queue state (maps to `<prefix>_progress_snapshots`)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub zero_result: i64,
    pub rate_per_min: f64,
    pub eta_seconds: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// An item that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PermanentFailure {
    pub item_key: String,
    pub attempts: i32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_round_trip() {
        for status in [
            RunStatus::Running,
            RunStatus::Resume,
            RunStatus::Partial,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("interrupted".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_resumable_statuses() {
        assert!(RunStatus::Running.is_resumable());
        assert!(RunStatus::Resume.is_resumable());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_item_status_parse() {
        assert_eq!("in_progress".parse::<ItemStatus>().unwrap(), ItemStatus::InProgress);
        assert_eq!("zero_result".parse::<ItemStatus>().unwrap(), ItemStatus::ZeroResult);
        assert!("claimed".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_outcome_status() {
        assert_eq!(Outcome::Completed { result_count: 2 }.status(), ItemStatus::Completed);
        assert_eq!(Outcome::ZeroResult.status(), ItemStatus::ZeroResult);
        let failed = Outcome::Failed { error: "timeout".into() };
        assert_eq!(failed.status(), ItemStatus::Failed);
        assert_eq!(failed.error(), Some("timeout"));
    }

    #[test]
    fn test_queue_counts() {
        let mut counts = QueueCounts::default();
        counts.add(ItemStatus::Pending, 3);
        counts.add(ItemStatus::InProgress, 2);
        counts.add(ItemStatus::Completed, 10);
        counts.add(ItemStatus::Failed, 1);
        counts.add(ItemStatus::ZeroResult, 4);
        assert_eq!(counts.total(), 20);
        assert_eq!(counts.remaining(), 5);
        assert_eq!(counts.done(), 15);
        assert_eq!(counts.scraped(), 14);
    }
}
