//! Admin job queue lifecycle: FIFO claims, lease heartbeats, terminal
//! idempotence, and expired-lease reclaim.

mod common;

use gridwatch::clock::Clock;
use gridwatch::db::JobOutcome;
use std::time::Duration;

const LEASE_TTL: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;

#[tokio::test]
async fn enqueue_claim_finish_round_trip() {
    let ctx = common::setup().await;
    let now = ctx.clock.now_utc();

    let id = ctx
        .store
        .enqueue_job("broadcast", r#"{"v":1,"text":"hello"}"#, Some("test"), now)
        .await
        .unwrap();
    let pending = ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(pending.status, "pending");
    assert_eq!(pending.attempts, 0);

    let claimed = ctx.store.claim_job("w1", now).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, "running");
    assert_eq!(claimed.attempts, 1);
    assert!(claimed.started_at.is_some());
    assert!(claimed.updated_at.is_some());

    ctx.store
        .finish_job(id, JobOutcome::Done, None, now)
        .await
        .unwrap();
    let done = ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(done.status, "done");
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn finish_is_idempotent() {
    let ctx = common::setup().await;
    let now = ctx.clock.now_utc();
    let id = ctx
        .store
        .enqueue_job("broadcast", "{}", None, now)
        .await
        .unwrap();
    ctx.store.claim_job("w1", now).await.unwrap().unwrap();
    ctx.store
        .finish_job(id, JobOutcome::Done, None, now)
        .await
        .unwrap();
    let first = ctx.store.get_job(id).await.unwrap().unwrap();

    // Finishing again (even with a different outcome) changes nothing.
    ctx.clock.advance(chrono::Duration::seconds(30));
    ctx.store
        .finish_job(id, JobOutcome::Failed, Some("late"), ctx.clock.now_utc())
        .await
        .unwrap();
    let second = ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(second.status, "done");
    assert_eq!(second.finished_at, first.finished_at);
    assert!(second.last_error.is_none());
}

#[tokio::test]
async fn claims_are_fifo_with_id_tiebreak() {
    let ctx = common::setup().await;
    let now = ctx.clock.now_utc();
    // Same created_at for all three: ties break by id.
    let a = ctx.store.enqueue_job("broadcast", "{}", None, now).await.unwrap();
    let b = ctx.store.enqueue_job("broadcast", "{}", None, now).await.unwrap();
    let c = ctx.store.enqueue_job("broadcast", "{}", None, now).await.unwrap();

    let order: Vec<i64> = vec![
        ctx.store.claim_job("w1", now).await.unwrap().unwrap().id,
        ctx.store.claim_job("w1", now).await.unwrap().unwrap().id,
        ctx.store.claim_job("w1", now).await.unwrap().unwrap().id,
    ];
    assert_eq!(order, vec![a, b, c]);
    assert!(ctx.store.claim_job("w1", now).await.unwrap().is_none());
}

#[tokio::test]
async fn older_jobs_claim_first() {
    let ctx = common::setup().await;
    let t0 = ctx.clock.now_utc();
    ctx.clock.advance(chrono::Duration::seconds(5));
    let newer = ctx
        .store
        .enqueue_job("broadcast", "{}", None, ctx.clock.now_utc())
        .await
        .unwrap();
    // Inserted later but stamped earlier.
    let older = ctx.store.enqueue_job("broadcast", "{}", None, t0).await.unwrap();

    let first = ctx.store.claim_job("w1", ctx.clock.now_utc()).await.unwrap().unwrap();
    assert_eq!(first.id, older);
    let second = ctx.store.claim_job("w1", ctx.clock.now_utc()).await.unwrap().unwrap();
    assert_eq!(second.id, newer);
}

#[tokio::test]
async fn heartbeat_updates_progress_and_lease() {
    let ctx = common::setup().await;
    let now = ctx.clock.now_utc();
    let id = ctx.store.enqueue_job("broadcast", "{}", None, now).await.unwrap();
    ctx.store.claim_job("w1", now).await.unwrap().unwrap();

    ctx.clock.advance(chrono::Duration::seconds(2));
    let later = ctx.clock.now_utc();
    ctx.store.job_heartbeat(id, 50, 120, later).await.unwrap();

    let job = ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.progress_current, 50);
    assert_eq!(job.progress_total, 120);
    assert_eq!(job.updated_at, Some(later));
}

// == Scenario 6: lease reclaim ================================================

#[tokio::test]
async fn dead_worker_lease_is_reclaimed() {
    let ctx = common::setup().await;
    let id = ctx
        .store
        .enqueue_job("broadcast", "{}", None, ctx.clock.now_utc())
        .await
        .unwrap();
    ctx.store.claim_job("w1", ctx.clock.now_utc()).await.unwrap().unwrap();

    // Worker dies: no heartbeat for lease_ttl + 1s.
    ctx.clock.advance(chrono::Duration::seconds(61));
    let (requeued, failed) = ctx
        .store
        .reclaim_expired_jobs(LEASE_TTL, MAX_ATTEMPTS, ctx.clock.now_utc())
        .await
        .unwrap();
    assert_eq!((requeued, failed), (1, 0));

    let job = ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, "pending");
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn lease_reclaim_fails_job_after_max_attempts() {
    let ctx = common::setup().await;
    let id = ctx
        .store
        .enqueue_job("broadcast", "{}", None, ctx.clock.now_utc())
        .await
        .unwrap();

    for round in 1..=MAX_ATTEMPTS {
        let claimed = ctx.store.claim_job("w1", ctx.clock.now_utc()).await.unwrap().unwrap();
        assert_eq!(claimed.attempts as u32, round);
        ctx.clock.advance(chrono::Duration::seconds(61));
        ctx.store
            .reclaim_expired_jobs(LEASE_TTL, MAX_ATTEMPTS, ctx.clock.now_utc())
            .await
            .unwrap();
    }

    let job = ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, "failed");
    assert_eq!(job.last_error.as_deref(), Some("lease expired"));
    assert_eq!(job.attempts as u32, MAX_ATTEMPTS);
    // Nothing left to claim.
    assert!(ctx.store.claim_job("w1", ctx.clock.now_utc()).await.unwrap().is_none());
}

#[tokio::test]
async fn live_lease_is_not_reclaimed() {
    let ctx = common::setup().await;
    let id = ctx
        .store
        .enqueue_job("broadcast", "{}", None, ctx.clock.now_utc())
        .await
        .unwrap();
    ctx.store.claim_job("w1", ctx.clock.now_utc()).await.unwrap().unwrap();

    // Heartbeats keep arriving inside the TTL.
    for _ in 0..3 {
        ctx.clock.advance(chrono::Duration::seconds(30));
        ctx.store
            .job_heartbeat(id, 0, 0, ctx.clock.now_utc())
            .await
            .unwrap();
        let (requeued, failed) = ctx
            .store
            .reclaim_expired_jobs(LEASE_TTL, MAX_ATTEMPTS, ctx.clock.now_utc())
            .await
            .unwrap();
        assert_eq!((requeued, failed), (0, 0));
    }
    assert_eq!(ctx.store.get_job(id).await.unwrap().unwrap().status, "running");
}
