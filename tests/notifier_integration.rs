//! Notifier fan-out against a scripted mock messenger: quiet hours,
//! deduplication, the global switch, retries, and permanent-error
//! retirement.

mod common;

use gridwatch::clock::Clock;
use gridwatch::db::{EventType, LightNotifyPayload, KIND_LIGHT_NOTIFY};
use gridwatch::messenger::{Messenger, MessengerError, MockMessenger};
use gridwatch::notifier::{Notifier, NotifierSettings};
use gridwatch::prom_metrics::Metrics;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

struct Harness {
    ctx: common::TestContext,
    notifier: Arc<Notifier>,
    mock: Arc<MockMessenger>,
    shutdown: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
}

async fn harness(admin_ids: &[i64]) -> Harness {
    let ctx = common::setup().await;
    let mock = Arc::new(MockMessenger::new());
    let settings = NotifierSettings {
        rate_per_sec: 500.0,
        max_retries: 1,
        admin_ids: admin_ids.iter().copied().collect::<HashSet<i64>>(),
        local_utc_offset_hours: 0,
    };
    let notifier = Notifier::new(
        ctx.store.clone(),
        ctx.clock.clone(),
        mock.clone() as Arc<dyn Messenger>,
        Arc::new(Metrics::new()),
        settings,
    );
    let (tx, rx) = watch::channel(false);
    Harness {
        ctx,
        notifier,
        mock,
        shutdown: rx,
        _shutdown_tx: tx,
    }
}

/// Commit a transition and run its notification job through the notifier.
async fn deliver_transition(h: &Harness, building: i64, section: i64, is_up: bool) -> i64 {
    let now = h.ctx.clock.now_utc();
    let event_id = h
        .ctx
        .store
        .commit_transition(building, section, is_up, now)
        .await
        .unwrap()
        .expect("transition should produce an event");
    let payload = LightNotifyPayload {
        v: 1,
        building_id: building,
        section_id: section,
        event_type: EventType::from_is_up(is_up),
        timestamp: now,
        event_id,
    };
    deliver_payload(h, &payload).await;
    event_id
}

async fn deliver_payload(h: &Harness, payload: &LightNotifyPayload) {
    let now = h.ctx.clock.now_utc();
    let id = h
        .ctx
        .store
        .enqueue_job(
            KIND_LIGHT_NOTIFY,
            &serde_json::to_string(payload).unwrap(),
            Some("test"),
            now,
        )
        .await
        .unwrap();
    let job = h.ctx.store.claim_job("w1", now).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    h.notifier.process_job(&job, &h.shutdown).await.unwrap();
}

// == Scenario 5: quiet hours ==================================================

#[tokio::test]
async fn quiet_hours_suppress_then_allow() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(42, Some(1), Some(2), now).await.unwrap();
    h.ctx.store.set_quiet_hours(42, Some(23), Some(7)).await.unwrap();

    // A down transition at local hour 2: suppressed.
    h.ctx.clock.set("2025-06-02T02:00:00Z".parse().unwrap());
    deliver_transition(&h, 1, 2, false).await;
    assert_eq!(h.mock.sent_to(42).len(), 0);

    // The recovery at hour 9: delivered.
    h.ctx.clock.set("2025-06-02T09:00:00Z".parse().unwrap());
    deliver_transition(&h, 1, 2, true).await;
    let sent = h.mock.sent_to(42);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("restored"));
}

#[tokio::test]
async fn admins_ignore_quiet_hours() {
    let h = harness(&[99]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(42, Some(1), Some(2), now).await.unwrap();
    h.ctx.store.upsert_subscriber(99, Some(1), Some(2), now).await.unwrap();
    for chat in [42, 99] {
        h.ctx.store.set_quiet_hours(chat, Some(23), Some(7)).await.unwrap();
    }

    h.ctx.clock.set("2025-06-02T03:00:00Z".parse().unwrap());
    deliver_transition(&h, 1, 2, false).await;
    assert_eq!(h.mock.sent_to(42).len(), 0);
    assert_eq!(h.mock.sent_to(99).len(), 1);
}

// == Filtering ================================================================

#[tokio::test]
async fn fan_out_respects_section_and_toggle() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    // Matching section, section-agnostic, other section, toggle off.
    h.ctx.store.upsert_subscriber(1, Some(1), Some(2), now).await.unwrap();
    h.ctx.store.upsert_subscriber(2, Some(1), None, now).await.unwrap();
    h.ctx.store.upsert_subscriber(3, Some(1), Some(1), now).await.unwrap();
    h.ctx.store.upsert_subscriber(4, Some(1), Some(2), now).await.unwrap();
    h.ctx.store.set_light_notifications(4, false).await.unwrap();
    // Different building entirely.
    h.ctx.store.upsert_subscriber(5, Some(2), Some(2), now).await.unwrap();

    deliver_transition(&h, 1, 2, true).await;
    assert_eq!(h.mock.sent_to(1).len(), 1);
    assert_eq!(h.mock.sent_to(2).len(), 1);
    assert_eq!(h.mock.sent_to(3).len(), 0);
    assert_eq!(h.mock.sent_to(4).len(), 0);
    assert_eq!(h.mock.sent_to(5).len(), 0);
}

#[tokio::test]
async fn global_switch_silences_all_but_admins() {
    let h = harness(&[99]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(42, Some(1), Some(2), now).await.unwrap();
    h.ctx.store.upsert_subscriber(99, Some(1), Some(2), now).await.unwrap();
    h.ctx
        .store
        .kv_set("light_notifications_global", "off")
        .await
        .unwrap();

    deliver_transition(&h, 1, 2, false).await;
    assert_eq!(h.mock.sent_to(42).len(), 0);
    assert_eq!(h.mock.sent_to(99).len(), 1);

    // Switch back on: deliveries resume.
    h.ctx
        .store
        .kv_set("light_notifications_global", "on")
        .await
        .unwrap();
    deliver_transition(&h, 1, 2, true).await;
    assert_eq!(h.mock.sent_to(42).len(), 1);
}

// == Deduplication ============================================================

#[tokio::test]
async fn duplicate_event_fanout_is_suppressed() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(42, Some(1), Some(2), now).await.unwrap();

    let event_id = deliver_transition(&h, 1, 2, true).await;
    // The same event re-delivered inside the 10 s window (duplicate job).
    let payload = LightNotifyPayload {
        v: 1,
        building_id: 1,
        section_id: 2,
        event_type: EventType::Up,
        timestamp: now,
        event_id,
    };
    deliver_payload(&h, &payload).await;
    assert_eq!(h.mock.sent_to(42).len(), 1);
}

// == Delivery errors ==========================================================

#[tokio::test]
async fn transient_error_is_retried() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(42, Some(1), Some(2), now).await.unwrap();
    h.mock
        .fail_next(42, MessengerError::Transient("gateway timeout".into()));

    deliver_transition(&h, 1, 2, true).await;
    assert_eq!(h.mock.sent_to(42).len(), 1, "retry should have delivered");

    let sub = h.ctx.store.get_subscriber(42).await.unwrap().unwrap();
    assert!(sub.is_active);
}

#[tokio::test]
async fn permanent_error_retires_subscriber_and_job_continues() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(42, Some(1), Some(2), now).await.unwrap();
    h.ctx.store.upsert_subscriber(43, Some(1), Some(2), now).await.unwrap();
    h.mock
        .fail_next(42, MessengerError::Permanent("bot was blocked".into()));

    deliver_transition(&h, 1, 2, false).await;

    // The blocked subscriber is retired; the other still got the message.
    let retired = h.ctx.store.get_subscriber(42).await.unwrap().unwrap();
    assert!(!retired.is_active);
    assert_eq!(h.mock.sent_to(43).len(), 1);
}

// == Broadcast jobs ===========================================================

#[tokio::test]
async fn broadcast_reaches_all_active_subscribers() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    h.ctx.store.upsert_subscriber(1, Some(1), Some(1), now).await.unwrap();
    h.ctx.store.upsert_subscriber(2, Some(2), None, now).await.unwrap();
    h.ctx.store.upsert_subscriber(3, None, None, now).await.unwrap();
    h.ctx.store.set_subscriber_active(3, false).await.unwrap();

    let id = h
        .ctx
        .store
        .enqueue_job(
            "broadcast",
            r#"{"v":1,"text":"Water shutoff at noon"}"#,
            Some("operator"),
            now,
        )
        .await
        .unwrap();
    let job = h.ctx.store.claim_job("w1", now).await.unwrap().unwrap();
    h.notifier.process_job(&job, &h.shutdown).await.unwrap();

    assert_eq!(h.mock.sent_count(), 2);
    assert_eq!(h.mock.sent_to(3).len(), 0);

    let finished = h.ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(finished.status, "done");
    assert_eq!(finished.progress_current, 2);
    assert_eq!(finished.progress_total, 2);
}

#[tokio::test]
async fn malformed_payload_fails_the_job() {
    let h = harness(&[]).await;
    let now = h.ctx.clock.now_utc();
    let id = h
        .ctx
        .store
        .enqueue_job(KIND_LIGHT_NOTIFY, "{not json", Some("test"), now)
        .await
        .unwrap();
    let job = h.ctx.store.claim_job("w1", now).await.unwrap().unwrap();
    h.notifier.process_job(&job, &h.shutdown).await.unwrap();

    let failed = h.ctx.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(failed.status, "failed");
    assert!(failed.last_error.unwrap().contains("bad payload"));
}
