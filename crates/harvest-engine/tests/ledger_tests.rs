//! Run ledger integration tests
//!
//! Coverage:
//! - Start/resume lifecycle and the one-resumable-run-per-scraper rule
//! - Idempotent finalize
//! - Startup recovery
//! - Zero-result recheck flag

use harvest_engine::ledger::LedgerStore;
use harvest_engine::{EngineError, RunMode, RunStatus};
use serde_json::json;
use sqlx::PgPool;

mod helpers;

#[sqlx::test(migrations = "../../migrations")]
async fn test_start_creates_running_row(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);

    let run = ledger.start("run-1", "pharmacy_de", RunMode::Fresh).await?;
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.mode, RunMode::Fresh);
    assert!(run.ended_at.is_none());
    assert_eq!(run.items_scraped, 0);
    assert!(!run.zero_result_rechecked);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_start_stops_previous_resumable_run(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);

    ledger.start("run-1", "pharmacy_de", RunMode::Fresh).await?;
    ledger.start("run-2", "pharmacy_de", RunMode::Fresh).await?;
    ledger.start("other", "pharmacy_fr", RunMode::Fresh).await?;

    let first = ledger.get("run-1").await?.unwrap();
    assert_eq!(first.status, RunStatus::Stopped);
    assert!(first.ended_at.is_some());

    assert_eq!(ledger.get("run-2").await?.unwrap().status, RunStatus::Running);
    assert_eq!(ledger.get("other").await?.unwrap().status, RunStatus::Running);

    let latest = ledger.latest_resumable("pharmacy_de").await?.unwrap();
    assert_eq!(latest.run_id, "run-2");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_second_resumable_row_rejected_by_index(pool: PgPool) -> anyhow::Result<()> {
    LedgerStore::new(pool.clone())
        .start("run-1", "pharmacy_de", RunMode::Fresh)
        .await?;

    let result = sqlx::query(
        "INSERT INTO run_ledger (run_id, scraper_name, status, mode) VALUES ('x', 'pharmacy_de', 'resume', 'fresh')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "partial unique index should reject a second resumable row");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_ensure_exists_never_downgrades(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);

    let created = ledger.ensure_exists("run-1", "src", RunMode::Fresh).await?;
    assert_eq!(created.status, RunStatus::Running);

    ledger.finish("run-1", RunStatus::Completed, 5, 5, None, None).await?;

    let again = ledger.ensure_exists("run-1", "src", RunMode::Resume).await?;
    assert_eq!(again.status, RunStatus::Completed);
    assert_eq!(again.mode, RunMode::Fresh);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_finalize_is_idempotent(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("run-1", "src", RunMode::Fresh).await?;

    let first = ledger
        .finish("run-1", RunStatus::Completed, 100, 98, None, Some(&json!({"completed": 100})))
        .await?;
    assert!(first);

    let second = ledger
        .finish("run-1", RunStatus::Failed, 1, 1, Some("late failure"), None)
        .await?;
    assert!(!second, "second finalize must be a no-op");

    let run = ledger.get("run-1").await?.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.items_scraped, 100);
    assert_eq!(run.items_exported, 98);
    assert!(run.error_message.is_none());
    assert_eq!(run.totals, json!({"completed": 100}));
    assert!(run.ended_at.is_some());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_concurrent_finalize_changes_once(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("run-1", "src", RunMode::Fresh).await?;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .finish("run-1", RunStatus::Completed, i, i, None, None)
                    .await
            })
        })
        .collect();

    let mut changed = 0;
    for handle in handles {
        if handle.await?? {
            changed += 1;
        }
    }
    assert_eq!(changed, 1);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_finish_rejects_running(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("run-1", "src", RunMode::Fresh).await?;

    let err = ledger
        .finish("run-1", RunStatus::Running, 0, 0, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidFinalStatus { .. }));

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_finish_as_resume_keeps_run_open(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("run-1", "src", RunMode::Fresh).await?;

    assert!(ledger.finish("run-1", RunStatus::Resume, 10, 10, None, None).await?);

    let run = ledger.get("run-1").await?.unwrap();
    assert_eq!(run.status, RunStatus::Resume);
    assert!(run.ended_at.is_none());

    let resumed = ledger.resume("run-1").await?;
    assert_eq!(resumed.status, RunStatus::Running);
    assert_eq!(resumed.mode, RunMode::Resume);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_resume_errors(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);

    let err = ledger.resume("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound(_)));

    ledger.start("run-1", "src", RunMode::Fresh).await?;
    ledger.finish("run-1", RunStatus::Completed, 0, 0, None, None).await?;

    let err = ledger.resume("run-1").await.unwrap_err();
    match err {
        EngineError::NotResumable { run_id, status } => {
            assert_eq!(run_id, "run-1");
            assert_eq!(status, "completed");
        },
        other => panic!("unexpected error: {other}"),
    }

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_mark_transitions(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);

    ledger.start("run-1", "a", RunMode::Fresh).await?;
    assert!(ledger.mark_resumable("run-1").await?);
    assert!(!ledger.mark_resumable("run-1").await?, "already resume");
    assert!(ledger.mark_stopped("run-1").await?);
    assert!(!ledger.mark_stopped("run-1").await?);

    ledger.start("run-2", "b", RunMode::Fresh).await?;
    assert!(ledger.cancel("run-2").await?);
    assert_eq!(ledger.get("run-2").await?.unwrap().status, RunStatus::Cancelled);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_reopen_terminal_run(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);

    ledger.start("old", "src", RunMode::Fresh).await?;
    ledger.finish("old", RunStatus::Completed, 1, 1, Some("2 item(s) failed permanently"), None).await?;
    ledger.start("new", "src", RunMode::Fresh).await?;

    let reopened = ledger.reopen("old").await?;
    assert_eq!(reopened.status, RunStatus::Resume);
    assert!(reopened.ended_at.is_none());
    assert_eq!(ledger.get("new").await?.unwrap().status, RunStatus::Stopped);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_recover_on_startup(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool.clone());

    // Simulate leftovers the index would normally prevent: drop it for the setup
    sqlx::query("DROP INDEX uq_run_ledger_one_resumable").execute(&pool).await?;
    for (run_id, scraper, status, age_mins) in [
        ("de-old", "de", "running", 30),
        ("de-mid", "de", "resume", 20),
        ("de-new", "de", "running", 10),
        ("fr-only", "fr", "running", 5),
        ("fr-done", "fr", "completed", 1),
    ] {
        sqlx::query(
            "INSERT INTO run_ledger (run_id, scraper_name, status, mode, started_at) \
             VALUES ($1, $2, $3, 'fresh', NOW() - $4::bigint * INTERVAL '1 minute')",
        )
        .bind(run_id)
        .bind(scraper)
        .bind(status)
        .bind(age_mins as i64)
        .execute(&pool)
        .await?;
    }

    let report = ledger.recover_on_startup(None).await?;
    assert_eq!(report.resumable, vec!["de-new", "fr-only"]);
    assert_eq!(report.stopped, vec!["de-mid", "de-old"]);

    assert_eq!(ledger.get("de-new").await?.unwrap().status, RunStatus::Resume);
    assert_eq!(ledger.get("de-old").await?.unwrap().status, RunStatus::Stopped);
    assert_eq!(ledger.get("fr-only").await?.unwrap().status, RunStatus::Resume);
    assert_eq!(ledger.get("fr-done").await?.unwrap().status, RunStatus::Completed);

    // Running it again changes nothing
    let again = ledger.recover_on_startup(None).await?;
    assert_eq!(again.resumable, vec!["de-new", "fr-only"]);
    assert!(again.stopped.is_empty());

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_recover_scoped_to_scraper(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("de-1", "de", RunMode::Fresh).await?;
    ledger.start("fr-1", "fr", RunMode::Fresh).await?;

    let report = ledger.recover_on_startup(Some("de")).await?;
    assert_eq!(report.resumable, vec!["de-1"]);

    assert_eq!(ledger.get("de-1").await?.unwrap().status, RunStatus::Resume);
    assert_eq!(ledger.get("fr-1").await?.unwrap().status, RunStatus::Running);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_zero_result_recheck_claimed_once(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("run-1", "src", RunMode::Fresh).await?;

    assert!(ledger.claim_zero_result_recheck("run-1").await?);
    assert!(!ledger.claim_zero_result_recheck("run-1").await?);
    assert!(ledger.get("run-1").await?.unwrap().zero_result_rechecked);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_list_recent_and_mirrors(pool: PgPool) -> anyhow::Result<()> {
    let ledger = LedgerStore::new(pool);
    ledger.start("a", "src", RunMode::Fresh).await?;
    ledger.start("b", "src", RunMode::Fresh).await?;
    ledger.start("c", "other", RunMode::Fresh).await?;

    ledger.set_items_scraped("b", 42).await?;
    ledger.set_totals("b", &json!({"pages": 3})).await?;

    let recent = ledger.list_recent(Some("src"), 10).await?;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].run_id, "b");
    assert_eq!(recent[0].items_scraped, 42);
    assert_eq!(recent[0].totals, json!({"pages": 3}));

    assert_eq!(ledger.list_recent(None, 10).await?.len(), 3);
    assert_eq!(ledger.list_recent(None, 1).await?.len(), 1);

    Ok(())
}
