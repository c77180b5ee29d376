//! Comments on visible posts.
//!
//! Comments carry no domain events. Deletion is soft and restricted to the
//! comment's author.

use rusqlite::{params, Connection, OptionalExtension, Row};
use scribe_db::now_timestamp;
use serde::{Deserialize, Serialize};

use crate::error::BlogError;
use crate::post::get_post_by_slug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: i64,
    pub text: String,
    pub post_id: i64,
    pub user_id: i64,
    pub created_at: String,
}

const COMMENT_COLUMNS: &str = "id, text, post_id, user_id, created_at";

/// Trims a comment body and rejects an empty one.
pub fn validate_comment_text(text: &str) -> Result<String, BlogError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(BlogError::Validation("text is required".to_string()));
    }
    Ok(text.to_string())
}

/// Adds a comment to the visible post `slug`.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the post is missing, inactive or
/// deleted.
pub fn create_comment(
    conn: &Connection,
    slug: &str,
    user_id: i64,
    text: &str,
) -> Result<Comment, BlogError> {
    let post = get_post_by_slug(conn, slug)?;
    conn.execute(
        "INSERT INTO comments (post_id, user_id, text, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![post.id, user_id, text, now_timestamp()],
    )?;
    let id = conn.last_insert_rowid();
    get_comment(conn, id)?.ok_or_else(|| BlogError::NotFound(format!("comment {id}")))
}

/// Loads a comment that has not been deleted.
pub fn get_comment(conn: &Connection, id: i64) -> Result<Option<Comment>, BlogError> {
    let comment = conn
        .query_row(
            &format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?1 AND deleted_at IS NULL"),
            [id],
            map_row_to_comment,
        )
        .optional()?;
    Ok(comment)
}

/// Lists the comments of the visible post `slug`, oldest first.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the post is not visible.
pub fn list_comments(conn: &Connection, slug: &str) -> Result<Vec<Comment>, BlogError> {
    let post = get_post_by_slug(conn, slug)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COMMENT_COLUMNS} FROM comments
         WHERE post_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at ASC, id ASC"
    ))?;
    let rows = stmt.query_map([post.id], map_row_to_comment)?;
    let comments = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(comments)
}

/// Soft-deletes the caller's own comment.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the comment does not exist or is
/// already deleted, and `BlogError::Forbidden` if someone else wrote it.
pub fn delete_comment(conn: &Connection, id: i64, user_id: i64) -> Result<(), BlogError> {
    let comment =
        get_comment(conn, id)?.ok_or_else(|| BlogError::NotFound(format!("comment {id}")))?;
    if comment.user_id != user_id {
        return Err(BlogError::Forbidden("you are not the author".to_string()));
    }
    conn.execute(
        "UPDATE comments SET deleted_at = ?1 WHERE id = ?2",
        params![now_timestamp(), id],
    )?;
    Ok(())
}

fn map_row_to_comment(row: &Row) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        text: row.get(1)?,
        post_id: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}
