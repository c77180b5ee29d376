use std::time::Duration;

use scribe_bus::{EventBus, InMemoryBus, LogBus, LogBusSettings};
use scribe_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use scribe_server::audit::{count_dead_letters, count_entries, list_for_aggregate};
use scribe_server::consumer::{AuditConsumer, ConsumerSettings, HandleOutcome};
use scribe_types::{Envelope, PostCreated, PostDeleted, PostEvent, DEFAULT_TOPIC};
use tempfile::TempDir;

const GROUP: &str = "audit-test";

fn setup_pool(busy_timeout_ms: u64) -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("consumer.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings {
            busy_timeout_ms,
            pool_max_size: 4,
            durable_commits: false,
        },
    )
    .expect("failed to create pool");
    run_migrations(&pool.get().expect("conn")).expect("failed to run migrations");
    (dir, pool)
}

fn settings() -> ConsumerSettings {
    ConsumerSettings {
        group: GROUP.to_string(),
        fetch_wait: Duration::from_millis(200),
        retry_backoff: Duration::from_millis(10),
    }
}

fn created(post_id: &str) -> Envelope {
    Envelope::record(
        &PostEvent::Created(PostCreated {
            post_id: post_id.to_string(),
            title: "Title".to_string(),
            slug: "title".to_string(),
        }),
        Some("1".to_string()),
        None,
    )
    .expect("envelope")
}

fn audit_count(pool: &DbPool) -> i64 {
    count_entries(&pool.get().expect("conn")).expect("count")
}

#[tokio::test]
async fn redelivered_event_is_recorded_once() {
    let (_dir, pool) = setup_pool(5_000);
    let bus = InMemoryBus::new();
    let envelope = created("1");
    bus.publish(DEFAULT_TOPIC, &envelope).await.expect("publish");
    bus.publish(DEFAULT_TOPIC, &envelope).await.expect("republish");

    let mut consumer = AuditConsumer::new(
        pool.clone(),
        Box::new(bus.subscribe(GROUP, DEFAULT_TOPIC)),
        settings(),
    );
    assert_eq!(consumer.poll_once().await.expect("poll"), Some(HandleOutcome::Recorded));
    assert_eq!(consumer.poll_once().await.expect("poll"), Some(HandleOutcome::Duplicate));
    assert_eq!(consumer.poll_once().await.expect("poll"), None);
    assert_eq!(audit_count(&pool), 1);
}

#[tokio::test]
async fn poison_message_is_dead_lettered_and_skipped() {
    let (_dir, pool) = setup_pool(5_000);
    let bus = InMemoryBus::new();
    bus.append_raw(DEFAULT_TOPIC, b"9", b"{not an envelope");
    bus.publish(DEFAULT_TOPIC, &created("9")).await.expect("publish");

    let mut consumer = AuditConsumer::new(
        pool.clone(),
        Box::new(bus.subscribe(GROUP, DEFAULT_TOPIC)),
        settings(),
    );
    assert_eq!(
        consumer.poll_once().await.expect("poll"),
        Some(HandleOutcome::DeadLettered)
    );
    assert_eq!(consumer.poll_once().await.expect("poll"), Some(HandleOutcome::Recorded));

    let conn = pool.get().expect("conn");
    assert_eq!(count_dead_letters(&conn, GROUP).expect("count"), 1);
    assert_eq!(count_entries(&conn).expect("count"), 1);
}

#[tokio::test]
async fn locked_store_is_retried_not_skipped() {
    let (_dir, pool) = setup_pool(50);
    let bus = InMemoryBus::new();
    bus.publish(DEFAULT_TOPIC, &created("3")).await.expect("publish");

    let mut consumer = AuditConsumer::new(
        pool.clone(),
        Box::new(bus.subscribe(GROUP, DEFAULT_TOPIC)),
        settings(),
    );

    let blocker = pool.get().expect("conn");
    blocker.execute_batch("BEGIN IMMEDIATE").expect("lock");
    assert_eq!(consumer.poll_once().await.expect("poll"), Some(HandleOutcome::Retry));
    blocker.execute_batch("ROLLBACK").expect("unlock");
    drop(blocker);

    assert_eq!(consumer.poll_once().await.expect("poll"), Some(HandleOutcome::Recorded));
    assert_eq!(audit_count(&pool), 1);
    assert_eq!(count_dead_letters(&pool.get().expect("conn"), GROUP).expect("count"), 0);
}

#[tokio::test]
async fn persistent_store_failure_is_dead_lettered() {
    let (_dir, pool) = setup_pool(5_000);
    let bus = InMemoryBus::new();
    bus.publish(DEFAULT_TOPIC, &created("4")).await.expect("publish");
    pool.get()
        .expect("conn")
        .execute_batch("DROP TABLE audit_log")
        .expect("drop");

    let mut consumer = AuditConsumer::new(
        pool.clone(),
        Box::new(bus.subscribe(GROUP, DEFAULT_TOPIC)),
        settings(),
    );
    assert_eq!(
        consumer.poll_once().await.expect("poll"),
        Some(HandleOutcome::DeadLettered)
    );
    assert_eq!(consumer.poll_once().await.expect("poll"), None);
}

#[tokio::test]
async fn group_resumes_after_restart_on_log_broker() {
    let (dir, pool) = setup_pool(5_000);
    let broker_path = dir.path().join("broker.db");
    let broker = LogBus::open(
        broker_path.to_str().expect("utf-8 path"),
        LogBusSettings {
            partitions: 2,
            poll_interval: Duration::from_millis(10),
            ..LogBusSettings::default()
        },
    )
    .expect("broker");

    let post_id = "42";
    let first = created(post_id);
    let second = Envelope::record(
        &PostEvent::Deleted(PostDeleted {
            post_id: post_id.to_string(),
        }),
        None,
        None,
    )
    .expect("envelope");
    broker.publish(DEFAULT_TOPIC, &first).await.expect("publish");
    broker.publish(DEFAULT_TOPIC, &second).await.expect("publish");

    {
        let mut consumer = AuditConsumer::new(
            pool.clone(),
            Box::new(broker.subscribe(GROUP, DEFAULT_TOPIC)),
            settings(),
        );
        assert_eq!(consumer.poll_once().await.expect("poll"), Some(HandleOutcome::Recorded));
    }

    let mut restarted = AuditConsumer::new(
        pool.clone(),
        Box::new(broker.subscribe(GROUP, DEFAULT_TOPIC)),
        settings(),
    );
    assert_eq!(restarted.poll_once().await.expect("poll"), Some(HandleOutcome::Recorded));
    assert_eq!(restarted.poll_once().await.expect("poll"), None);

    let trail = list_for_aggregate(&pool.get().expect("conn"), "post", post_id).expect("trail");
    let types: Vec<_> = trail.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["PostCreated", "PostDeleted"]);
}
