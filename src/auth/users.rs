//! User records. A `User` row is created lazily the first time an identity
//! provider subject successfully authenticates — there is no signup flow.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::types::{User, UserId};

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let metadata: String = row.get("metadata")?;
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

pub fn get_user(conn: &Connection, id: &UserId) -> Result<Option<User>> {
    conn.query_row("SELECT * FROM users WHERE id = ?", params![id], user_from_row)
        .optional()
        .map_err(Error::from)
}

/// Creates the user row on first sight of this subject id, or returns the
/// existing row unchanged. Does not update `email` on repeat calls — use
/// `update_email` for that.
pub fn get_or_create_user(conn: &Connection, id: &UserId, email: &str) -> Result<User> {
    if let Some(existing) = get_user(conn, id)? {
        return Ok(existing);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (id, email, metadata, created_at, updated_at, is_active)
         VALUES (?, ?, '{}', ?, ?, 1)
         ON CONFLICT(id) DO NOTHING",
        params![id, email, now, now],
    )?;
    get_user(conn, id)?.ok_or_else(|| Error::Internal("user insert did not persist".into()))
}

pub fn deactivate_user(conn: &Connection, id: &UserId) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE users SET is_active = 0, updated_at = ? WHERE id = ?",
        params![Utc::now().to_rfc3339(), id],
    )?;
    Ok(affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations::run_migrations;

    fn conn() -> Connection {
        let c = Connection::open_in_memory().unwrap();
        run_migrations(&c).unwrap();
        c
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let c = conn();
        let first = get_or_create_user(&c, &"sub-1".to_string(), "a@example.com").unwrap();
        let second = get_or_create_user(&c, &"sub-1".to_string(), "ignored@example.com").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.email, "a@example.com");
    }

    #[test]
    fn deactivate_marks_inactive() {
        let c = conn();
        get_or_create_user(&c, &"sub-1".to_string(), "a@example.com").unwrap();
        assert!(deactivate_user(&c, &"sub-1".to_string()).unwrap());
        let user = get_user(&c, &"sub-1".to_string()).unwrap().unwrap();
        assert!(!user.is_active);
    }
}
