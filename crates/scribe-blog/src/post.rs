//! Post persistence.
//!
//! Every function takes a plain `&Connection`, so it can run either on its
//! own or inside a caller's transaction (a `Transaction` derefs to a
//! `Connection`). The service layer uses the latter to pair each mutation
//! with its outbox row.

use rusqlite::{params, Connection, OptionalExtension, Row};
use scribe_db::now_timestamp;
use serde::{Deserialize, Serialize};

use crate::error::BlogError;

/// Maximum title length, in characters.
pub const MAX_TITLE_CHARS: usize = 150;

/// Page size used when the caller gives none (or an invalid one).
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Largest page size a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A blog post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: i64,
    pub title: String,
    pub text: String,
    /// URL-safe unique identifier derived from the title at creation.
    pub slug: String,
    /// Author.
    pub user_id: i64,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields to change on an existing post. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostChanges {
    pub title: Option<String>,
    pub text: Option<String>,
}

impl PostChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.text.is_none()
    }
}

/// A normalised page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    /// Applies defaults: page 1, limit 10. A zero page, or a limit of zero
    /// or above [`MAX_PAGE_SIZE`], falls back to the default.
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.filter(|p| *p > 0).unwrap_or(1),
            limit: limit
                .filter(|l| (1..=MAX_PAGE_SIZE).contains(l))
                .unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> i64 {
        (i64::from(self.page) - 1) * i64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of posts plus the total number of matches.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PostPage {
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub posts: Vec<Post>,
}

const POST_COLUMNS: &str = "id, title, text, slug, user_id, is_active, created_at, updated_at";

/// Trims and checks a title.
///
/// # Errors
///
/// Returns `BlogError::Validation` if the title is empty after trimming or
/// longer than [`MAX_TITLE_CHARS`].
pub fn validate_title(title: &str) -> Result<String, BlogError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(BlogError::Validation("title is required".to_string()));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(BlogError::Validation(format!(
            "title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

/// Lowercases `title` and joins its ASCII alphanumeric runs with `-`.
///
/// Returns `"post"` when nothing usable is left.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("post");
    }
    slug
}

/// Finds a slug for `title` not used by any post, including deleted ones.
///
/// Tries the bare slug first, then `-2`, `-3`, and so on.
pub fn unique_slug(conn: &Connection, title: &str) -> Result<String, BlogError> {
    let base = slugify(title);
    let mut candidate = base.clone();
    let mut suffix = 1u32;
    loop {
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM posts WHERE slug = ?1)",
            [&candidate],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(candidate);
        }
        suffix += 1;
        candidate = format!("{base}-{suffix}");
    }
}

/// Inserts a post with a fresh unique slug.
///
/// `title` and `text` are stored as given; callers validate first.
pub fn insert_post(
    conn: &Connection,
    user_id: i64,
    title: &str,
    text: &str,
) -> Result<Post, BlogError> {
    let slug = unique_slug(conn, title)?;
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO posts (title, text, slug, user_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![title, text, slug, user_id, now],
    )?;
    let id = conn.last_insert_rowid();
    get_post_by_id(conn, id)?.ok_or_else(|| BlogError::NotFound(format!("post {id}")))
}

/// Loads a post by ID regardless of its visibility.
pub fn get_post_by_id(conn: &Connection, id: i64) -> Result<Option<Post>, BlogError> {
    let post = conn
        .query_row(
            &format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?1"),
            [id],
            map_row_to_post,
        )
        .optional()?;
    Ok(post)
}

/// Loads a visible (active, not deleted) post by slug.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if no visible post has that slug.
pub fn get_post_by_slug(conn: &Connection, slug: &str) -> Result<Post, BlogError> {
    conn.query_row(
        &format!(
            "SELECT {POST_COLUMNS} FROM posts
             WHERE slug = ?1 AND is_active = 1 AND deleted_at IS NULL"
        ),
        [slug],
        map_row_to_post,
    )
    .optional()?
    .ok_or_else(|| BlogError::NotFound(format!("post '{slug}'")))
}

/// Finds the visible post `slug` owned by `user_id`.
fn find_owned(conn: &Connection, slug: &str, user_id: i64) -> Result<Post, BlogError> {
    let post = get_post_by_slug(conn, slug)?;
    if post.user_id != user_id {
        return Err(BlogError::NotFound(format!("post '{slug}'")));
    }
    Ok(post)
}

/// Applies `changes` to the caller's own post in one UPDATE.
///
/// The slug never changes, so links stay valid after a retitle.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the post is missing, deleted, or owned
/// by someone else.
pub fn update_owned_post(
    conn: &Connection,
    slug: &str,
    user_id: i64,
    changes: &PostChanges,
) -> Result<Post, BlogError> {
    let post = find_owned(conn, slug, user_id)?;

    let title = changes.title.as_deref().unwrap_or(&post.title);
    let text = changes.text.as_deref().unwrap_or(&post.text);
    conn.execute(
        "UPDATE posts SET title = ?1, text = ?2, updated_at = ?3 WHERE id = ?4",
        params![title, text, now_timestamp(), post.id],
    )?;

    get_post_by_id(conn, post.id)?.ok_or_else(|| BlogError::NotFound(format!("post '{slug}'")))
}

/// Soft-deletes the caller's own post. The row and its slug are kept.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the post is missing, already deleted,
/// or owned by someone else.
pub fn soft_delete_owned_post(
    conn: &Connection,
    slug: &str,
    user_id: i64,
) -> Result<Post, BlogError> {
    let post = find_owned(conn, slug, user_id)?;
    let now = now_timestamp();
    conn.execute(
        "UPDATE posts SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![now, post.id],
    )?;
    Ok(post)
}

/// Lists visible posts, newest first, optionally filtered by a
/// case-insensitive title substring.
pub fn list_posts(
    conn: &Connection,
    pagination: Pagination,
    query: Option<&str>,
) -> Result<PostPage, BlogError> {
    let pattern = query
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{}%", escape_like(q)));

    let filter = "is_active = 1 AND deleted_at IS NULL
        AND (?1 IS NULL OR title LIKE ?1 ESCAPE '\\')";

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM posts WHERE {filter}"),
        [&pattern],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {POST_COLUMNS} FROM posts WHERE {filter}
         ORDER BY created_at DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        params![pattern, pagination.limit, pagination.offset()],
        map_row_to_post,
    )?;

    let mut posts = Vec::new();
    for row in rows {
        posts.push(row?);
    }

    Ok(PostPage {
        page: pagination.page,
        limit: pagination.limit,
        total,
        posts,
    })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn map_row_to_post(row: &Row) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        title: row.get(1)?,
        text: row.get(2)?,
        slug: row.get(3)?,
        user_id: row.get(4)?,
        is_active: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
