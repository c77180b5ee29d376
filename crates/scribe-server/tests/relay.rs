use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scribe_blog::{Actor, DeliveryMode, PostChanges, PostService};
use scribe_bus::{EventBus, InMemoryBus, PublishError};
use scribe_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use scribe_outbox::{
    count_by_status, create_within_transaction, fetch_batch_for_publish, get_record, ClaimRequest,
};
use scribe_server::relay::{BatchReport, OutboxRelay, RelaySettings};
use scribe_types::{
    Envelope, OutboxStatus, PostCreated, PostEvent, PostUpdated, DEFAULT_TOPIC,
};
use tempfile::TempDir;

fn setup_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("relay.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");
    run_migrations(&pool.get().expect("conn")).expect("failed to run migrations");
    (dir, pool)
}

fn settings(worker_id: &str, batch_size: usize) -> RelaySettings {
    RelaySettings {
        batch_size,
        poll_interval: Duration::from_millis(20),
        lease: Duration::from_secs(30),
        max_attempts: 0,
        worker_id: worker_id.to_string(),
    }
}

/// Writes `n` outbox rows for distinct posts directly.
fn seed_rows(pool: &DbPool, n: usize) -> Vec<String> {
    let mut conn = pool.get().expect("conn");
    let tx = conn.transaction().expect("tx");
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let envelope = Envelope::record(
            &PostEvent::Created(PostCreated {
                post_id: i.to_string(),
                title: format!("Post {i}"),
                slug: format!("post-{i}"),
            }),
            None,
            None,
        )
        .expect("envelope");
        create_within_transaction(&tx, DEFAULT_TOPIC, &envelope).expect("insert");
        ids.push(envelope.event_id.to_string());
    }
    tx.commit().expect("commit");
    ids
}

/// Writes one create and `updates` update events for a single post.
fn seed_post_history(pool: &DbPool, post_id: &str, updates: usize) -> Vec<String> {
    let mut conn = pool.get().expect("conn");
    let tx = conn.transaction().expect("tx");
    let mut events = vec![PostEvent::Created(PostCreated {
        post_id: post_id.to_string(),
        title: "History".into(),
        slug: "history".into(),
    })];
    for n in 0..updates {
        events.push(PostEvent::Updated(PostUpdated {
            post_id: post_id.to_string(),
            title: format!("History {n}"),
            slug: "history".into(),
        }));
    }
    let mut ids = Vec::with_capacity(events.len());
    for event in &events {
        let envelope = Envelope::record(event, None, None).expect("envelope");
        create_within_transaction(&tx, DEFAULT_TOPIC, &envelope).expect("insert");
        ids.push(envelope.event_id.to_string());
    }
    tx.commit().expect("commit");
    ids
}

/// Delays every publish before handing it to the wrapped bus.
struct SlowBus {
    inner: InMemoryBus,
    delay: Duration,
}

#[async_trait]
impl EventBus for SlowBus {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        tokio::time::sleep(self.delay).await;
        self.inner.publish(topic, envelope).await
    }
}

fn published_ids(bus: &InMemoryBus) -> Vec<String> {
    bus.envelopes(DEFAULT_TOPIC)
        .iter()
        .map(|e| e.event_id.to_string())
        .collect()
}

fn status_count(pool: &DbPool, status: OutboxStatus) -> i64 {
    count_by_status(&pool.get().expect("conn"), status).expect("count")
}

#[tokio::test]
async fn drain_publishes_every_row_and_marks_it_sent() {
    let (_dir, pool) = setup_pool();
    let expected = seed_rows(&pool, 12);
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 5));

    let report = relay.drain().await.expect("drain");
    assert_eq!(report.claimed, 12);
    assert_eq!(report.sent, 12);

    let published: Vec<String> = bus
        .envelopes(DEFAULT_TOPIC)
        .iter()
        .map(|e| e.event_id.to_string())
        .collect();
    assert_eq!(published, expected);
    assert_eq!(status_count(&pool, OutboxStatus::Sent), 12);
    assert_eq!(status_count(&pool, OutboxStatus::New), 0);

    let conn = pool.get().expect("conn");
    let record = get_record(&conn, 1).expect("query").expect("row");
    assert!(record.sent_at.is_some());
    assert!(record.claimed_by.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_relays_never_publish_a_row_twice() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 100);
    let bus = InMemoryBus::new();
    let first = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("relay-a", 10));
    let second = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("relay-b", 10));

    let (a, b) = tokio::join!(first.drain(), second.drain());
    let (a, b) = (a.expect("relay a"), b.expect("relay b"));
    assert_eq!(a.sent + b.sent, 100);

    let published = bus.envelopes(DEFAULT_TOPIC);
    assert_eq!(published.len(), 100);
    let unique: HashSet<_> = published.iter().map(|e| e.event_id).collect();
    assert_eq!(unique.len(), 100);
    assert_eq!(status_count(&pool, OutboxStatus::Sent), 100);
}

#[tokio::test]
async fn failed_publish_is_retried_with_the_same_event_id() {
    let (_dir, pool) = setup_pool();
    let ids = seed_rows(&pool, 1);
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 10));

    bus.fail_next(1);
    let report = relay.run_once().await.expect("tick");
    assert_eq!(
        report,
        BatchReport {
            claimed: 1,
            failed: 1,
            ..BatchReport::default()
        }
    );
    {
        let conn = pool.get().expect("conn");
        let record = get_record(&conn, 1).expect("query").expect("row");
        assert_eq!(record.status, OutboxStatus::New);
        assert_eq!(record.attempts, 1);
        assert!(record
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("injected")));
    }

    let report = relay.run_once().await.expect("tick");
    assert_eq!(report.sent, 1);

    let conn = pool.get().expect("conn");
    let record = get_record(&conn, 1).expect("query").expect("row");
    assert_eq!(record.status, OutboxStatus::Sent);
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.is_none());

    let published = bus.envelopes(DEFAULT_TOPIC);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].event_id.to_string(), ids[0]);
}

#[tokio::test]
async fn one_failing_row_does_not_stop_the_batch() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 3);
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 10));

    bus.fail_next(1);
    let report = relay.run_once().await.expect("tick");
    assert_eq!(report.claimed, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.sent, 2);
    assert_eq!(bus.messages().len(), 2);
}

#[tokio::test]
async fn row_goes_dead_at_the_attempt_cap() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 1);
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(
        pool.clone(),
        Arc::new(bus.clone()),
        RelaySettings {
            max_attempts: 2,
            ..settings("r1", 10)
        },
    );

    bus.set_available(false);
    assert_eq!(relay.run_once().await.expect("tick").failed, 1);
    assert_eq!(relay.run_once().await.expect("tick").dead, 1);
    assert_eq!(status_count(&pool, OutboxStatus::Dead), 1);

    bus.set_available(true);
    let report = relay.run_once().await.expect("tick");
    assert_eq!(report.claimed, 0);
    assert!(bus.messages().is_empty());
}

#[tokio::test]
async fn undecodable_row_is_marked_failed() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 1);
    pool.get()
        .expect("conn")
        .execute("UPDATE outbox_events SET payload = 'not json' WHERE id = 1", [])
        .expect("corrupt");
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 10));

    let report = relay.run_once().await.expect("tick");
    assert_eq!(report.failed, 1);
    assert!(bus.messages().is_empty());

    let conn = pool.get().expect("conn");
    let record = get_record(&conn, 1).expect("query").expect("row");
    assert!(record
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("marshal error")));
}

#[tokio::test]
async fn crashed_claim_is_reclaimed_after_lease_expiry() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 2);

    // A worker claims both rows and dies without marking them.
    {
        let mut conn = pool.get().expect("conn");
        let claimed = fetch_batch_for_publish(
            &mut conn,
            &ClaimRequest {
                worker_id: "crashed".into(),
                limit: 10,
                lease: Duration::from_millis(200),
            },
        )
        .expect("claim");
        assert_eq!(claimed.len(), 2);
    }

    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r2", 10));
    assert_eq!(relay.run_once().await.expect("tick").claimed, 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = relay.run_once().await.expect("tick");
    assert_eq!(report.claimed, 2);
    assert_eq!(report.sent, 2);
}

#[tokio::test]
async fn events_of_one_post_are_published_in_order() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let user = service.create_user("writer").await.expect("user");
    let actor = Actor::new(user.id);

    let post = service
        .create_post(&actor, "Ordering", "v1")
        .await
        .expect("create");
    for text in ["v2", "v3"] {
        service
            .update_post(
                &actor,
                &post.slug,
                PostChanges {
                    title: None,
                    text: Some(text.to_string()),
                },
            )
            .await
            .expect("update");
    }

    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 50));
    relay.drain().await.expect("drain");

    let types: Vec<String> = bus
        .envelopes(DEFAULT_TOPIC)
        .into_iter()
        .filter(|e| e.aggregate_id == post.id.to_string())
        .map(|e| e.event_type)
        .collect();
    assert_eq!(types, vec!["PostCreated", "PostUpdated", "PostUpdated"]);
}

#[tokio::test]
async fn run_loop_publishes_and_stops_on_shutdown() {
    let (_dir, pool) = setup_pool();
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 10));
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(rx).await });

    seed_rows(&pool, 3);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bus.messages().len() < 3 {
        assert!(tokio::time::Instant::now() < deadline, "relay did not publish");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tx.send(true).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("relay stopped")
        .expect("relay task");
}

#[tokio::test]
async fn outage_with_a_full_batch_waits_for_the_next_tick() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 10);
    let bus = InMemoryBus::new();
    bus.set_available(false);
    let relay = OutboxRelay::new(
        pool.clone(),
        Arc::new(bus.clone()),
        RelaySettings {
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            max_attempts: 20,
            ..settings("r1", 10)
        },
    );
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { relay.run(rx).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    tx.send(true).expect("send shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("relay stopped")
        .expect("relay task");

    assert_eq!(status_count(&pool, OutboxStatus::New), 10);
    assert_eq!(status_count(&pool, OutboxStatus::Dead), 0);
    let max_attempts: i64 = pool
        .get()
        .expect("conn")
        .query_row("SELECT MAX(attempts) FROM outbox_events", [], |row| row.get(0))
        .expect("attempts");
    assert!(max_attempts <= 1, "retried {max_attempts} times within one tick");
}

#[tokio::test]
async fn failed_row_holds_back_the_rest_of_its_post() {
    let (_dir, pool) = setup_pool();
    let ids = seed_post_history(&pool, "7", 2);
    let bus = InMemoryBus::new();
    let relay = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("r1", 10));

    bus.fail_next(1);
    let report = relay.run_once().await.expect("tick");
    assert_eq!(
        report,
        BatchReport {
            claimed: 3,
            failed: 1,
            skipped: 2,
            ..BatchReport::default()
        }
    );
    assert!(bus.messages().is_empty());
    {
        let conn = pool.get().expect("conn");
        for (id, attempts) in [(1, 1), (2, 0), (3, 0)] {
            let record = get_record(&conn, id).expect("query").expect("row");
            assert_eq!(record.status, OutboxStatus::New);
            assert_eq!(record.attempts, attempts);
            assert!(record.claimed_by.is_none(), "row {id} released");
        }
    }

    let report = relay.run_once().await.expect("tick");
    assert_eq!(report.sent, 3);
    assert_eq!(published_ids(&bus), ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn row_taken_over_mid_batch_is_not_published_by_the_slow_relay() {
    let (_dir, pool) = setup_pool();
    seed_rows(&pool, 2);
    let bus = InMemoryBus::new();
    let slow = OutboxRelay::new(
        pool.clone(),
        Arc::new(SlowBus {
            inner: bus.clone(),
            delay: Duration::from_millis(150),
        }),
        RelaySettings {
            lease: Duration::from_millis(50),
            ..settings("slow", 10)
        },
    );
    let slow_tick = tokio::spawn(async move { slow.run_once().await });

    // Both leases have expired while row 1 is still publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let taken = {
        let mut conn = pool.get().expect("conn");
        fetch_batch_for_publish(
            &mut conn,
            &ClaimRequest {
                worker_id: "fast".into(),
                limit: 10,
                lease: Duration::from_secs(30),
            },
        )
        .expect("takeover")
    };
    assert_eq!(taken.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

    let report = slow_tick.await.expect("join").expect("tick");
    assert_eq!(report.sent, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(bus.messages().len(), 1);

    let record = get_record(&pool.get().expect("conn"), 2).expect("query").expect("row");
    assert_eq!(record.status, OutboxStatus::New);
    assert_eq!(record.claimed_by.as_deref(), Some("fast"));
    assert_eq!(record.attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_relay_and_fast_relay_keep_one_post_in_order() {
    let (_dir, pool) = setup_pool();
    let expected = seed_post_history(&pool, "42", 4);
    let bus = InMemoryBus::new();
    let slow = OutboxRelay::new(
        pool.clone(),
        Arc::new(SlowBus {
            inner: bus.clone(),
            delay: Duration::from_millis(100),
        }),
        RelaySettings {
            lease: Duration::from_millis(250),
            ..settings("slow", 10)
        },
    );
    let fast = OutboxRelay::new(pool.clone(), Arc::new(bus.clone()), settings("fast", 10));

    let slow_tick = tokio::spawn(async move { slow.run_once().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    fast.run_once().await.expect("fast tick");
    slow_tick.await.expect("join").expect("slow tick");
    fast.drain().await.expect("fast drain");

    assert_eq!(published_ids(&bus), expected);
    assert_eq!(status_count(&pool, OutboxStatus::Sent), 5);
}
