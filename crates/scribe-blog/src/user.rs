//! Minimal user records.
//!
//! Credentials live with the upstream auth service; this table only gives
//! posts an owner and events an actor.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{is_constraint_violation, BlogError};

/// Maximum username length, in characters.
pub const MAX_USERNAME_CHARS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: String,
}

/// Checks a username: 1 to 64 ASCII letters, digits, `_`, `-` or `.`.
pub fn validate_username(username: &str) -> Result<String, BlogError> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(BlogError::Validation(format!(
            "username must be 1 to {MAX_USERNAME_CHARS} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(BlogError::Validation(
            "username may only contain letters, digits, '_', '-' and '.'".to_string(),
        ));
    }
    Ok(username.to_string())
}

/// Creates a user.
///
/// # Errors
///
/// Returns `BlogError::Validation` for a malformed username and
/// `BlogError::Conflict` if it is taken.
pub fn create_user(conn: &Connection, username: &str) -> Result<User, BlogError> {
    let username = validate_username(username)?;
    match conn.execute("INSERT INTO users (username) VALUES (?1)", [&username]) {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(BlogError::Conflict(format!(
                "username '{username}' is taken"
            )));
        }
        Err(e) => return Err(e.into()),
    }
    let id = conn.last_insert_rowid();
    get_user(conn, id)?.ok_or_else(|| BlogError::NotFound(format!("user {id}")))
}

pub fn get_user(conn: &Connection, id: i64) -> Result<Option<User>, BlogError> {
    let user = conn
        .query_row(
            "SELECT id, username, created_at FROM users WHERE id = ?1",
            [id],
            map_row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> Result<Option<User>, BlogError> {
    let user = conn
        .query_row(
            "SELECT id, username, created_at FROM users WHERE username = ?1",
            [username],
            map_row_to_user,
        )
        .optional()?;
    Ok(user)
}

fn map_row_to_user(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        created_at: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().expect("failed to open in-memory db");
        scribe_db::run_migrations(&conn).expect("failed to run migrations");
        conn
    }

    #[test]
    fn create_and_find() {
        let conn = setup_db();
        let user = create_user(&conn, " alice ").expect("create");
        assert_eq!(user.username, "alice");

        let found = find_user_by_username(&conn, "alice").expect("query");
        assert_eq!(found, Some(user));
        assert_eq!(find_user_by_username(&conn, "nobody").expect("query"), None);
    }

    #[test]
    fn duplicate_username_conflicts() {
        let conn = setup_db();
        create_user(&conn, "bob").expect("create");
        assert!(matches!(
            create_user(&conn, "bob"),
            Err(BlogError::Conflict(_))
        ));
    }

    #[test]
    fn invalid_usernames_rejected() {
        let long = "x".repeat(MAX_USERNAME_CHARS + 1);
        for bad in ["", "   ", "has space", "semi;colon", long.as_str()] {
            assert!(
                matches!(validate_username(bad), Err(BlogError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_username("a.b-c_d9").is_ok());
    }
}
