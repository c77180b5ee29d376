//! Blog domain for the Scribe platform.
//!
//! Implements users and posts (create, update, soft delete, lookup by slug,
//! paginated search), plus comments and likes on posts, on top of the
//! primary SQLite store. Every post mutation produces exactly one domain
//! event; comments and likes produce none. By default the event is
//! written to the transactional outbox in the same transaction as the
//! mutation; the opt-in direct mode publishes it after commit instead.

pub mod comment;
mod error;
pub mod like;
pub mod post;
mod service;
pub mod user;

pub use comment::Comment;
pub use error::BlogError;
pub use post::{Pagination, Post, PostChanges, PostPage, MAX_PAGE_SIZE, MAX_TITLE_CHARS};
pub use service::{Actor, DeliveryMode, PostService};
pub use user::User;
