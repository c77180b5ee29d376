//! Post likes: at most one per user and post.

use rusqlite::{params, Connection};
use scribe_db::now_timestamp;

use crate::error::{is_constraint_violation, BlogError};
use crate::post::get_post_by_slug;

/// Records that `user_id` likes the visible post `slug`.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the post is not visible and
/// `BlogError::Conflict` if the user already likes it.
pub fn like_post(conn: &Connection, slug: &str, user_id: i64) -> Result<(), BlogError> {
    let post = get_post_by_slug(conn, slug)?;
    match conn.execute(
        "INSERT INTO post_likes (user_id, post_id, created_at) VALUES (?1, ?2, ?3)",
        params![user_id, post.id, now_timestamp()],
    ) {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => {
            Err(BlogError::Conflict("post already liked".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Removes `user_id`'s like from the visible post `slug`. Removing a like
/// that does not exist is not an error.
///
/// # Errors
///
/// Returns `BlogError::NotFound` if the post is not visible.
pub fn unlike_post(conn: &Connection, slug: &str, user_id: i64) -> Result<(), BlogError> {
    let post = get_post_by_slug(conn, slug)?;
    conn.execute(
        "DELETE FROM post_likes WHERE user_id = ?1 AND post_id = ?2",
        params![user_id, post.id],
    )?;
    Ok(())
}

/// Number of likes on the visible post `slug`.
pub fn count_likes(conn: &Connection, slug: &str) -> Result<i64, BlogError> {
    let post = get_post_by_slug(conn, slug)?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM post_likes WHERE post_id = ?1",
        [post.id],
        |row| row.get(0),
    )?;
    Ok(count)
}
