//! Request middleware: authentication and correlation IDs.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use scribe_blog::User;
use std::sync::Arc;

use crate::api::ApiError;
use crate::AppState;

/// Header carrying the caller's correlation ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The authenticated caller, stored in request extensions.
#[derive(Clone, Debug)]
pub struct AuthUser(pub User);

/// The request's correlation ID, stored in request extensions.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Authenticates `Authorization: Bearer <username>`.
///
/// Credentials belong to the upstream identity service; by the time a
/// request reaches this server the bearer token is the verified username.
/// Unknown users are rejected with 401.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let username = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;

    let state = req
        .extensions()
        .get::<Arc<AppState>>()
        .ok_or_else(|| ApiError::InternalServerError("application state missing".to_string()))?
        .clone();

    let user = state
        .posts
        .find_user_by_username(&username)
        .await
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?
        .ok_or_else(|| ApiError::Unauthorized("unknown user".to_string()))?;

    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

/// Takes the caller's `X-Request-Id` or assigns a fresh one, and echoes it
/// on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse::<HeaderValue>() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
