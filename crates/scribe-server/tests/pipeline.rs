use std::time::Duration;

use scribe_blog::{Actor, PostChanges};
use scribe_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use scribe_outbox::count_by_status;
use scribe_server::audit::list_for_aggregate;
use scribe_server::config::{BrokerKind, Config};
use scribe_server::startup::{join_with_grace, Broker};
use scribe_server::{spawn_pipeline, AppState};
use scribe_types::OutboxStatus;
use tempfile::TempDir;

fn setup_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("pipeline.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("failed to create pool");
    run_migrations(&pool.get().expect("conn")).expect("failed to run migrations");
    (dir, pool)
}

async fn wait_for_trail(pool: &DbPool, post_id: &str, expected: usize) -> Vec<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let trail = list_for_aggregate(&pool.get().expect("conn"), "post", post_id).expect("trail");
        if trail.len() >= expected {
            return trail.into_iter().map(|e| e.event_type).collect();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "audit trail incomplete: {} of {expected}",
            trail.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_reach_the_audit_log_through_the_relay() {
    let (_dir, pool) = setup_pool();
    let mut config = Config::default();
    config.broker.kind = BrokerKind::Memory;
    config.relay.embedded = true;
    config.relay.poll_interval_ms = 20;
    config.consumer.fetch_wait_ms = 50;

    let broker = Broker::connect(&config.broker).expect("broker");
    let (tx, rx) = tokio::sync::watch::channel(false);
    let tasks = spawn_pipeline(pool.clone(), &broker, &config, rx).expect("pipeline");

    let state = AppState::new(pool.clone(), &config, &broker);
    let user = state.posts.create_user("alice").await.expect("user");
    let actor = Actor::new(user.id).with_correlation_id("req-pipeline");
    let post = state
        .posts
        .create_post(&actor, "Through the pipe", "v1")
        .await
        .expect("create");
    state
        .posts
        .update_post(
            &actor,
            &post.slug,
            PostChanges {
                title: None,
                text: Some("v2".into()),
            },
        )
        .await
        .expect("update");
    state
        .posts
        .delete_post(&actor, &post.slug)
        .await
        .expect("delete");

    let trail = wait_for_trail(&pool, &post.id.to_string(), 3).await;
    assert_eq!(trail, vec!["PostCreated", "PostUpdated", "PostDeleted"]);
    assert_eq!(
        count_by_status(&pool.get().expect("conn"), OutboxStatus::Sent).expect("count"),
        3
    );

    tx.send(true).expect("send shutdown");
    tokio::time::timeout(
        Duration::from_secs(5),
        join_with_grace(tasks, Duration::from_secs(3)),
    )
    .await
    .expect("pipeline stopped");
}
