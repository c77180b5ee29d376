//! HTTP handlers for users, posts, comments and likes.
//!
//! Every response body is `{"ok": true, "data": ...}` or
//! `{"ok": false, "error": "..."}`.

use crate::middleware::{AuthUser, RequestId};
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use scribe_blog::{Actor, BlogError, Pagination, PostChanges};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

/// Request body for `POST /api/users`.
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

/// Request body for `POST /api/posts`.
#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub title: String,
    #[serde(default)]
    pub text: String,
}

/// Request body for `PATCH /api/posts/{slug}`. Absent fields are unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdatePostRequest {
    pub title: Option<String>,
    pub text: Option<String>,
}

/// Request body for `POST /api/posts/{slug}/comments`.
#[derive(Debug, Deserialize)]
pub struct CreateCommentRequest {
    pub text: String,
}

/// Query string for `GET /api/posts`.
///
/// Values that do not parse fall back to the defaults rather than failing
/// the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListPostsQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub q: Option<String>,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The write committed but the event could not be published.
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::InternalServerError(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        let body = Json(json!({
            "ok": false,
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<BlogError> for ApiError {
    fn from(e: BlogError) -> Self {
        match e {
            BlogError::NotFound(msg) => ApiError::NotFound(msg),
            BlogError::Forbidden(msg) => ApiError::Forbidden(msg),
            BlogError::NoFieldsToUpdate => ApiError::BadRequest("no fields to update".to_string()),
            BlogError::Validation(msg) => ApiError::BadRequest(msg),
            BlogError::Conflict(msg) => ApiError::Conflict(msg),
            BlogError::Publish(inner) => ApiError::BadGateway(inner.to_string()),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

/// Wraps a successful result.
fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(json!({ "ok": true, "data": data }))).into_response()
}

fn actor(user: &AuthUser, request_id: RequestId) -> Actor {
    Actor::new(user.0.id).with_correlation_id(request_id.0)
}

/// Handler for `POST /api/users`.
pub async fn create_user_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<Response, ApiError> {
    let user = state.posts.create_user(&payload.username).await?;
    tracing::info!(user_id = user.id, username = %user.username, "user created");
    Ok(ok(StatusCode::CREATED, user))
}

/// Handler for `GET /api/posts?page&limit&q`.
pub async fn list_posts_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ListPostsQuery>,
) -> Result<Response, ApiError> {
    let page = query.page.as_deref().and_then(|v| v.trim().parse().ok());
    let limit = query.limit.as_deref().and_then(|v| v.trim().parse().ok());
    let pagination = Pagination::new(page, limit);

    let result = state.posts.list_posts(pagination, query.q).await?;
    Ok(ok(StatusCode::OK, result))
}

/// Handler for `GET /api/posts/{slug}`.
pub async fn get_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let post = state.posts.get_post(&slug).await?;
    Ok(ok(StatusCode::OK, post))
}

/// Handler for `POST /api/posts`.
pub async fn create_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Json(payload): Json<CreatePostRequest>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    let post = state
        .posts
        .create_post(&actor, &payload.title, &payload.text)
        .await?;
    Ok(ok(StatusCode::CREATED, post))
}

/// Handler for `PATCH /api/posts/{slug}`.
pub async fn update_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Path(slug): Path<String>,
    Json(payload): Json<UpdatePostRequest>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    let changes = PostChanges {
        title: payload.title,
        text: payload.text,
    };
    let post = state.posts.update_post(&actor, &slug, changes).await?;
    Ok(ok(StatusCode::OK, post))
}

/// Handler for `DELETE /api/posts/{slug}`.
pub async fn delete_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    state.posts.delete_post(&actor, &slug).await?;
    Ok(ok(StatusCode::OK, json!({ "slug": slug, "deleted": true })))
}

/// Handler for `GET /api/posts/{slug}/comments`.
pub async fn list_comments_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let comments = state.posts.list_comments(&slug).await?;
    Ok(ok(StatusCode::OK, comments))
}

/// Handler for `POST /api/posts/{slug}/comments`.
pub async fn create_comment_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Path(slug): Path<String>,
    Json(payload): Json<CreateCommentRequest>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    let comment = state
        .posts
        .create_comment(&actor, &slug, &payload.text)
        .await?;
    Ok(ok(StatusCode::CREATED, comment))
}

/// Handler for `DELETE /api/comments/{id}`.
pub async fn delete_comment_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    state.posts.delete_comment(&actor, id).await?;
    Ok(ok(StatusCode::OK, json!({ "id": id, "deleted": true })))
}

/// Handler for `GET /api/posts/{slug}/likes`.
pub async fn count_likes_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let likes = state.posts.count_likes(&slug).await?;
    Ok(ok(StatusCode::OK, json!({ "likes": likes })))
}

/// Handler for `POST /api/posts/{slug}/like`.
pub async fn like_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    state.posts.like_post(&actor, &slug).await?;
    Ok(ok(StatusCode::CREATED, json!({ "liked": true })))
}

/// Handler for `DELETE /api/posts/{slug}/like`.
pub async fn unlike_post_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Extension(request_id): Extension<RequestId>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let actor = actor(&user, request_id);
    state.posts.unlike_post(&actor, &slug).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
