//! The write path: business mutations paired with their domain events.

use std::sync::Arc;

use rusqlite::{Transaction, TransactionBehavior};
use scribe_bus::EventBus;
use scribe_db::DbPool;
use scribe_outbox::{create_within_transaction, InsertOutcome};
use scribe_types::{
    Envelope, PostCreated, PostDeleted, PostEvent, PostUpdated, DEFAULT_TOPIC,
};

use crate::comment::{self, Comment};
use crate::error::BlogError;
use crate::like;
use crate::post::{self, Pagination, Post, PostChanges, PostPage};
use crate::user::{self, User};

/// How a committed mutation's event reaches the bus.
#[derive(Clone)]
pub enum DeliveryMode {
    /// Record the event in the outbox inside the mutation's transaction.
    /// The relay publishes it later. Events are never lost.
    Outbox { topic: String },
    /// Commit the mutation, then publish synchronously. A crash or publish
    /// failure after the commit loses the event; the caller sees
    /// [`BlogError::Publish`] in the latter case.
    Direct { topic: String, bus: Arc<dyn EventBus> },
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Outbox {
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

impl std::fmt::Debug for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Outbox { topic } => f.debug_struct("Outbox").field("topic", topic).finish(),
            DeliveryMode::Direct { topic, .. } => {
                f.debug_struct("Direct").field("topic", topic).finish_non_exhaustive()
            }
        }
    }
}

/// Who is performing a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    /// Propagated into the event envelope when present.
    pub correlation_id: Option<String>,
}

impl Actor {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Post operations over a connection pool.
///
/// Each mutation runs in one `IMMEDIATE` transaction that changes `posts`
/// and, in outbox mode, inserts exactly one outbox row. Either both commit
/// or neither does.
#[derive(Clone)]
pub struct PostService {
    pool: DbPool,
    delivery: DeliveryMode,
}

impl PostService {
    pub fn new(pool: DbPool, delivery: DeliveryMode) -> Self {
        Self { pool, delivery }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Creates a post and emits `PostCreated`.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad title; `Outbox` or `Database` if the write
    /// failed (nothing committed); `Publish` in direct mode if the event
    /// could not be sent after commit.
    pub async fn create_post(
        &self,
        actor: &Actor,
        title: &str,
        text: &str,
    ) -> Result<Post, BlogError> {
        let title = post::validate_title(title)?;
        let text = text.trim().to_string();
        let user_id = actor.user_id;

        self.write(actor, move |tx| {
            let post = post::insert_post(tx, user_id, &title, &text)?;
            let event = PostEvent::Created(PostCreated {
                post_id: post.id.to_string(),
                title: post.title.clone(),
                slug: post.slug.clone(),
            });
            Ok((post, event))
        })
        .await
    }

    /// Updates the caller's post and emits `PostUpdated`.
    ///
    /// # Errors
    ///
    /// `NoFieldsToUpdate` if `changes` is empty; `NotFound` if the post is
    /// missing or not owned by the actor; otherwise as [`create_post`](Self::create_post).
    pub async fn update_post(
        &self,
        actor: &Actor,
        slug: &str,
        changes: PostChanges,
    ) -> Result<Post, BlogError> {
        if changes.is_empty() {
            return Err(BlogError::NoFieldsToUpdate);
        }
        let changes = PostChanges {
            title: changes.title.as_deref().map(post::validate_title).transpose()?,
            text: changes.text.map(|t| t.trim().to_string()),
        };
        let slug = slug.to_string();
        let user_id = actor.user_id;

        self.write(actor, move |tx| {
            let post = post::update_owned_post(tx, &slug, user_id, &changes)?;
            let event = PostEvent::Updated(PostUpdated {
                post_id: post.id.to_string(),
                title: post.title.clone(),
                slug: post.slug.clone(),
            });
            Ok((post, event))
        })
        .await
    }

    /// Soft-deletes the caller's post and emits `PostDeleted`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the post is missing, already deleted, or not owned by
    /// the actor; otherwise as [`create_post`](Self::create_post).
    pub async fn delete_post(&self, actor: &Actor, slug: &str) -> Result<(), BlogError> {
        let slug = slug.to_string();
        let user_id = actor.user_id;

        self.write(actor, move |tx| {
            let post = post::soft_delete_owned_post(tx, &slug, user_id)?;
            let event = PostEvent::Deleted(PostDeleted {
                post_id: post.id.to_string(),
            });
            Ok((post, event))
        })
        .await
        .map(|_| ())
    }

    pub async fn get_post(&self, slug: &str) -> Result<Post, BlogError> {
        let slug = slug.to_string();
        self.read(move |conn| post::get_post_by_slug(conn, &slug))
            .await
    }

    pub async fn list_posts(
        &self,
        pagination: Pagination,
        query: Option<String>,
    ) -> Result<PostPage, BlogError> {
        self.read(move |conn| post::list_posts(conn, pagination, query.as_deref()))
            .await
    }

    /// Comments on a visible post. No event is emitted.
    ///
    /// # Errors
    ///
    /// `Validation` for blank text; `NotFound` if the post is not visible.
    pub async fn create_comment(
        &self,
        actor: &Actor,
        slug: &str,
        text: &str,
    ) -> Result<Comment, BlogError> {
        let text = comment::validate_comment_text(text)?;
        let slug = slug.to_string();
        let user_id = actor.user_id;
        let created = self
            .read(move |conn| comment::create_comment(conn, &slug, user_id, &text))
            .await?;
        tracing::info!(comment_id = created.id, post_id = created.post_id, "comment created");
        Ok(created)
    }

    pub async fn list_comments(&self, slug: &str) -> Result<Vec<Comment>, BlogError> {
        let slug = slug.to_string();
        self.read(move |conn| comment::list_comments(conn, &slug))
            .await
    }

    /// Deletes the actor's own comment.
    ///
    /// # Errors
    ///
    /// `NotFound` if the comment is gone; `Forbidden` if the actor did not
    /// write it.
    pub async fn delete_comment(&self, actor: &Actor, comment_id: i64) -> Result<(), BlogError> {
        let user_id = actor.user_id;
        self.read(move |conn| comment::delete_comment(conn, comment_id, user_id))
            .await
    }

    /// # Errors
    ///
    /// `NotFound` if the post is not visible; `Conflict` if already liked.
    pub async fn like_post(&self, actor: &Actor, slug: &str) -> Result<(), BlogError> {
        let slug = slug.to_string();
        let user_id = actor.user_id;
        self.read(move |conn| like::like_post(conn, &slug, user_id))
            .await
    }

    pub async fn unlike_post(&self, actor: &Actor, slug: &str) -> Result<(), BlogError> {
        let slug = slug.to_string();
        let user_id = actor.user_id;
        self.read(move |conn| like::unlike_post(conn, &slug, user_id))
            .await
    }

    pub async fn count_likes(&self, slug: &str) -> Result<i64, BlogError> {
        let slug = slug.to_string();
        self.read(move |conn| like::count_likes(conn, &slug))
            .await
    }

    pub async fn create_user(&self, username: &str) -> Result<User, BlogError> {
        let username = username.to_string();
        self.read(move |conn| user::create_user(conn, &username))
            .await
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<User>, BlogError> {
        let username = username.to_string();
        self.read(move |conn| user::find_user_by_username(conn, &username))
            .await
    }

    async fn read<T, F>(&self, f: F) -> Result<T, BlogError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, BlogError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| BlogError::Internal(format!("task join error: {e}")))?
    }

    /// Runs `mutate` in a transaction and delivers the event it returns
    /// according to the delivery mode.
    async fn write<F>(&self, actor: &Actor, mutate: F) -> Result<Post, BlogError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<(Post, PostEvent), BlogError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let outbox_topic = match &self.delivery {
            DeliveryMode::Outbox { topic } => Some(topic.clone()),
            DeliveryMode::Direct { .. } => None,
        };
        let actor_id = actor.user_id.to_string();
        let correlation_id = actor.correlation_id.clone();

        let (post, envelope) = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (post, event) = mutate(&tx)?;
            let envelope = Envelope::record(&event, Some(actor_id), correlation_id)?;

            if let Some(topic) = outbox_topic {
                if create_within_transaction(&tx, &topic, &envelope)? == InsertOutcome::Duplicate {
                    tracing::warn!(event_id = %envelope.event_id, "outbox already held this event");
                }
            }
            tx.commit()?;
            Ok::<_, BlogError>((post, envelope))
        })
        .await
        .map_err(|e| BlogError::Internal(format!("task join error: {e}")))??;

        tracing::info!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            post_id = post.id,
            "post mutation committed"
        );

        if let DeliveryMode::Direct { topic, bus } = &self.delivery {
            if let Err(e) = bus.publish(topic, &envelope).await {
                tracing::error!(
                    event_id = %envelope.event_id,
                    error = %e,
                    "direct publish failed after commit; event not delivered"
                );
                return Err(BlogError::Publish(e));
            }
        }

        Ok(post)
    }
}
