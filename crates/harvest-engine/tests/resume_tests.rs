//! Resume-sync integration tests
//!
//! A resumed run owes exactly: input keys, minus keys with stored results,
//! minus keys already final in its queue.

use std::collections::HashSet;

use harvest_engine::queue::WorkQueue;
use harvest_engine::{ItemStatus, Outcome};
use sqlx::PgPool;

mod helpers;
use helpers::{keys, tables};

const MAX_ATTEMPTS: i32 = 3;

async fn finish(queue: &WorkQueue, key: &str, outcome: Outcome) -> anyhow::Result<()> {
    // Claim until the key comes up; earlier keys go back to pending
    let claimed = queue.claim_batch("run-1", "w", 1000).await?;
    assert!(claimed.iter().any(|c| c.item_key == key), "{key} not claimable");
    queue.complete("run-1", key, "w", &outcome).await?;
    queue.release_claims("run-1", "w").await?;
    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_sync_computes_remaining(pool: PgPool) -> anyhow::Result<()> {
    let tables = tables(&pool, "sync").await;
    let queue = WorkQueue::new(pool, &tables);
    queue.seed("run-1", &keys(6)).await?;

    finish(&queue, "item-000", Outcome::Completed { result_count: 1 }).await?;
    finish(&queue, "item-001", Outcome::ZeroResult).await?;
    finish(&queue, "item-002", Outcome::Failed { error: "x".into() }).await?;

    // item-003 already has results from an earlier run
    let materialized: HashSet<String> = ["item-003".to_string()].into_iter().collect();

    let mut input = keys(6);
    input.push("item-new".to_string());

    let report = queue.sync_remaining("run-1", &input, &materialized, MAX_ATTEMPTS).await?;
    assert_eq!(report.input, 7);
    // item-002 (retryable), item-004, item-005, item-new
    assert_eq!(report.remaining, 4);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.marked_completed, 1);
    assert_eq!(report.removed, 0);

    assert_eq!(
        queue.get_item("run-1", "item-003").await?.unwrap().status,
        ItemStatus::Completed
    );
    let retried = queue.get_item("run-1", "item-002").await?.unwrap();
    assert_eq!(retried.status, ItemStatus::Pending);
    assert_eq!(retried.attempts, 1);

    let counts = queue.counts("run-1").await?;
    assert_eq!(counts.pending, 4);
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.zero_result, 1);

    // Nothing left to change
    let again = queue.sync_remaining("run-1", &input, &materialized, MAX_ATTEMPTS).await?;
    assert!(!again.changed(), "second sync should be a no-op: {again:?}");
    assert_eq!(again.remaining, 4);

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_sync_leaves_exhausted_failures(pool: PgPool) -> anyhow::Result<()> {
    let tables = tables(&pool, "exhaust").await;
    let queue = WorkQueue::new(pool.clone(), &tables);
    queue.seed("run-1", &keys(2)).await?;

    finish(&queue, "item-000", Outcome::Failed { error: "gone".into() }).await?;
    sqlx::query(&format!(
        "UPDATE {} SET attempts = $1 WHERE item_key = 'item-000'",
        tables.work_queue()
    ))
    .bind(MAX_ATTEMPTS)
    .execute(&pool)
    .await?;

    let report = queue.sync_remaining("run-1", &keys(2), &HashSet::new(), MAX_ATTEMPTS).await?;
    assert_eq!(report.remaining, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(
        queue.get_item("run-1", "item-000").await?.unwrap().status,
        ItemStatus::Failed
    );

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_sync_drops_keys_removed_from_input(pool: PgPool) -> anyhow::Result<()> {
    let tables = tables(&pool, "shrink").await;
    let queue = WorkQueue::new(pool, &tables);
    queue.seed("run-1", &keys(5)).await?;
    finish(&queue, "item-004", Outcome::Completed { result_count: 1 }).await?;

    let input: Vec<String> = keys(2);
    let report = queue.sync_remaining("run-1", &input, &HashSet::new(), MAX_ATTEMPTS).await?;
    assert_eq!(report.remaining, 2);
    assert_eq!(report.removed, 2, "pending item-002 and item-003 leave the queue");

    assert!(queue.get_item("run-1", "item-002").await?.is_none());
    // History of finished items stays
    assert!(queue.get_item("run-1", "item-004").await?.is_some());

    Ok(())
}
