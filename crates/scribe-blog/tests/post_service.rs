//! End-to-end tests for the blog write path against a real SQLite file.

use std::sync::Arc;

use scribe_blog::{Actor, BlogError, DeliveryMode, Pagination, PostChanges, PostService};
use scribe_bus::InMemoryBus;
use scribe_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use scribe_outbox::get_by_event_id;
use scribe_types::{OutboxStatus, PostEvent, DEFAULT_TOPIC};
use tempfile::TempDir;

fn setup_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("blog.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("pool");
    run_migrations(&pool.get().expect("conn")).expect("migrations");
    (dir, pool)
}

async fn author(service: &PostService, name: &str) -> Actor {
    let user = service.create_user(name).await.expect("create user");
    Actor::new(user.id)
}

fn outbox_rows(pool: &DbPool) -> Vec<(String, String, String, String)> {
    let conn = pool.get().expect("conn");
    let mut stmt = conn
        .prepare("SELECT event_type, aggregate_id, status, topic FROM outbox_events ORDER BY id")
        .expect("prepare");
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .expect("query");
    rows.map(|r| r.expect("row")).collect()
}

fn count(pool: &DbPool, sql: &str) -> i64 {
    pool.get()
        .expect("conn")
        .query_row(sql, [], |row| row.get(0))
        .expect("count")
}

#[tokio::test]
async fn each_mutation_writes_exactly_one_outbox_row() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let alice = author(&service, "alice").await;

    let post = service
        .create_post(&alice, "Hello World", "first")
        .await
        .expect("create");
    assert_eq!(post.slug, "hello-world");

    service
        .update_post(
            &alice,
            &post.slug,
            PostChanges {
                title: Some("Hello Again".into()),
                text: None,
            },
        )
        .await
        .expect("update");
    service.delete_post(&alice, &post.slug).await.expect("delete");

    let rows = outbox_rows(&pool);
    let id = post.id.to_string();
    assert_eq!(
        rows,
        vec![
            ("PostCreated".into(), id.clone(), "NEW".into(), DEFAULT_TOPIC.into()),
            ("PostUpdated".into(), id.clone(), "NEW".into(), DEFAULT_TOPIC.into()),
            ("PostDeleted".into(), id, "NEW".into(), DEFAULT_TOPIC.into()),
        ]
    );
}

#[tokio::test]
async fn envelope_carries_actor_and_correlation() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let alice = author(&service, "alice").await.with_correlation_id("req-42");

    let post = service
        .create_post(&alice, "Tracing", "")
        .await
        .expect("create");

    let conn = pool.get().expect("conn");
    let event_id: String = conn
        .query_row("SELECT event_id FROM outbox_events", [], |row| row.get(0))
        .expect("event id");
    let record = get_by_event_id(&conn, &event_id)
        .expect("lookup")
        .expect("row exists");
    assert_eq!(record.status, OutboxStatus::New);

    let envelope = record.to_envelope().expect("envelope");
    assert_eq!(envelope.actor_user_id, Some(alice.user_id.to_string()));
    assert_eq!(envelope.correlation_id.as_deref(), Some("req-42"));
    assert_eq!(envelope.aggregate_id, post.id.to_string());
}

#[tokio::test]
async fn failed_outbox_insert_rolls_back_the_post() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let alice = author(&service, "alice").await;

    pool.get()
        .expect("conn")
        .execute_batch(
            "CREATE TRIGGER reject_outbox BEFORE INSERT ON outbox_events
             BEGIN SELECT RAISE(ABORT, 'outbox unavailable'); END;",
        )
        .expect("trigger");

    let result = service.create_post(&alice, "Doomed", "never stored").await;
    assert!(matches!(result, Err(BlogError::Outbox(_))), "got {result:?}");

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM posts"), 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM outbox_events"), 0);
}

#[tokio::test]
async fn failed_business_write_leaves_no_event() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let alice = author(&service, "alice").await;
    let bob = author(&service, "bob").await;

    let post = service
        .create_post(&alice, "Mine", "")
        .await
        .expect("create");

    let result = service.delete_post(&bob, &post.slug).await;
    assert!(matches!(result, Err(BlogError::NotFound(_))));
    assert_eq!(outbox_rows(&pool).len(), 1);

    let result = service
        .update_post(&alice, &post.slug, PostChanges::default())
        .await;
    assert!(matches!(result, Err(BlogError::NoFieldsToUpdate)));
    assert_eq!(outbox_rows(&pool).len(), 1);
}

#[tokio::test]
async fn validation_happens_before_any_write() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let alice = author(&service, "alice").await;

    let long_title = "t".repeat(151);
    for bad in ["", "   ", long_title.as_str()] {
        let result = service.create_post(&alice, bad, "body").await;
        assert!(matches!(result, Err(BlogError::Validation(_))), "{bad:?}");
    }
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM posts"), 0);
    assert!(outbox_rows(&pool).is_empty());
}

#[tokio::test]
async fn deleted_posts_disappear_from_reads() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool, DeliveryMode::default());
    let alice = author(&service, "alice").await;

    let keep = service.create_post(&alice, "Keep me", "").await.expect("create");
    let drop = service.create_post(&alice, "Drop me", "").await.expect("create");
    service.delete_post(&alice, &drop.slug).await.expect("delete");

    assert!(matches!(
        service.get_post(&drop.slug).await,
        Err(BlogError::NotFound(_))
    ));
    assert_eq!(service.get_post(&keep.slug).await.expect("get"), keep);

    let page = service
        .list_posts(Pagination::default(), None)
        .await
        .expect("list");
    assert_eq!(page.total, 1);
    assert_eq!(page.posts, vec![keep]);

    let again = service.delete_post(&alice, &drop.slug).await;
    assert!(matches!(again, Err(BlogError::NotFound(_))));
}

#[tokio::test]
async fn direct_mode_publishes_after_commit() {
    let (_dir, pool) = setup_pool();
    let bus = InMemoryBus::new();
    let service = PostService::new(
        pool.clone(),
        DeliveryMode::Direct {
            topic: "direct.events".into(),
            bus: Arc::new(bus.clone()),
        },
    );
    let alice = author(&service, "alice").await;

    let post = service
        .create_post(&alice, "Direct", "")
        .await
        .expect("create");

    assert!(outbox_rows(&pool).is_empty());
    let published = bus.envelopes("direct.events");
    assert_eq!(published.len(), 1);
    let event = PostEvent::decode(&published[0].event_type, &published[0].payload)
        .expect("decode");
    assert_eq!(event.post_id(), post.id.to_string());
}

#[tokio::test]
async fn direct_mode_publish_failure_keeps_the_write() {
    let (_dir, pool) = setup_pool();
    let bus = InMemoryBus::new();
    let service = PostService::new(
        pool.clone(),
        DeliveryMode::Direct {
            topic: DEFAULT_TOPIC.into(),
            bus: Arc::new(bus.clone()),
        },
    );
    let alice = author(&service, "alice").await;

    bus.set_available(false);
    let result = service.create_post(&alice, "Lost event", "").await;
    assert!(matches!(result, Err(BlogError::Publish(_))), "got {result:?}");

    // The post committed but its event is gone: the dual-write gap.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM posts"), 1);
    assert!(bus.envelopes(DEFAULT_TOPIC).is_empty());
    assert!(outbox_rows(&pool).is_empty());
}

#[tokio::test]
async fn comments_and_likes_emit_no_events() {
    let (_dir, pool) = setup_pool();
    let service = PostService::new(pool.clone(), DeliveryMode::default());
    let alice = author(&service, "alice").await;
    let bob = author(&service, "bob").await;
    let post = service
        .create_post(&alice, "Talk to me", "")
        .await
        .expect("create");

    let comment = service
        .create_comment(&bob, &post.slug, "  nice post ")
        .await
        .expect("comment");
    assert_eq!(comment.text, "nice post");
    assert!(matches!(
        service.create_comment(&bob, &post.slug, "   ").await,
        Err(BlogError::Validation(_))
    ));
    assert!(matches!(
        service.delete_comment(&alice, comment.id).await,
        Err(BlogError::Forbidden(_))
    ));

    service.like_post(&bob, &post.slug).await.expect("like");
    assert!(matches!(
        service.like_post(&bob, &post.slug).await,
        Err(BlogError::Conflict(_))
    ));
    assert_eq!(service.count_likes(&post.slug).await.expect("count"), 1);
    service.unlike_post(&bob, &post.slug).await.expect("unlike");
    assert_eq!(service.count_likes(&post.slug).await.expect("count"), 0);

    service
        .delete_comment(&bob, comment.id)
        .await
        .expect("author deletes");
    assert!(service
        .list_comments(&post.slug)
        .await
        .expect("list")
        .is_empty());

    // Only the PostCreated row.
    assert_eq!(outbox_rows(&pool).len(), 1);
}
