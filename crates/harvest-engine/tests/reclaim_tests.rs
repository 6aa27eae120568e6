//! Stale-claim reclaimer integration tests

use std::time::Duration;

use harvest_engine::queue::WorkQueue;
use harvest_engine::reclaim::{reclaim_stale, reset_all_in_progress, StaleClaimReclaimer};
use harvest_engine::ItemStatus;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

mod helpers;
use helpers::{age_claims, keys, tables};

#[sqlx::test(migrations = "../../migrations")]
async fn test_stale_claims_return_to_pending(pool: PgPool) -> anyhow::Result<()> {
    let tables = tables(&pool, "stale").await;
    let queue = WorkQueue::new(pool.clone(), &tables);
    queue.seed("run-1", &keys(10)).await?;

    // A worker claims and dies
    queue.claim_batch("run-1", "dead-worker", 4).await?;
    // A live worker holds fresh claims
    queue.claim_batch("run-1", "live-worker", 3).await?;
    sqlx::query(&format!(
        "UPDATE {} SET claimed_at = NOW() - INTERVAL '2 hours' WHERE claimed_by = 'dead-worker'",
        tables.work_queue()
    ))
    .execute(&pool)
    .await?;

    let reclaimed = reclaim_stale(&queue, "run-1", Duration::from_secs(30 * 60)).await?;
    assert_eq!(reclaimed, 4);

    let counts = queue.counts("run-1").await?;
    assert_eq!(counts.pending, 7);
    assert_eq!(counts.in_progress, 3);

    let item = queue.get_item("run-1", "item-000").await?.unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert!(item.claimed_by.is_none());
    assert!(item.claimed_at.is_none());

    // Reclaimed items are claimable again
    let again = queue.claim_batch("run-1", "new-worker", 10).await?;
    assert_eq!(again.len(), 7);
    assert_eq!(again[0].item_key, "item-000");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_reset_all_in_progress(pool: PgPool) -> anyhow::Result<()> {
    let tables = tables(&pool, "resetall").await;
    let queue = WorkQueue::new(pool, &tables);
    queue.seed("run-1", &keys(5)).await?;
    queue.seed("run-2", &keys(5)).await?;
    queue.claim_batch("run-1", "w", 5).await?;
    queue.claim_batch("run-2", "w", 5).await?;

    assert_eq!(reset_all_in_progress(&queue, "run-1").await?, 5);
    assert_eq!(queue.counts("run-1").await?.pending, 5);
    assert_eq!(queue.counts("run-2").await?.in_progress, 5, "other runs untouched");

    Ok(())
}

#[sqlx::test(migrations = "../../migrations")]
async fn test_background_reclaimer_restores_liveness(pool: PgPool) -> anyhow::Result<()> {
    helpers::init_tracing();
    let tables = tables(&pool, "bg").await;
    let queue = WorkQueue::new(pool.clone(), &tables);
    queue.seed("run-1", &keys(3)).await?;
    queue.claim_batch("run-1", "crashed", 3).await?;
    age_claims(&pool, &tables, "run-1", Duration::from_secs(120)).await;

    let cancel = CancellationToken::new();
    let task = StaleClaimReclaimer::new(
        queue.clone(),
        "run-1",
        Duration::from_secs(60),
        Duration::from_millis(100),
    )
    .spawn(cancel.clone());

    let mut pending = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pending = queue.counts("run-1").await?.pending;
        if pending == 3 {
            break;
        }
    }
    assert_eq!(pending, 3, "reclaimer should have returned every stale claim");

    cancel.cancel();
    assert_eq!(task.await?, 3);

    Ok(())
}
