//! User lookup.
//!
//! The `users` table is a read projection of the account service. The gateway
//! only reads it; `create_user` and `set_active` exist for operator tooling
//! and tests.

use crate::IdentityError;
use parley_types::UserId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// A resolved, authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
    pub active: bool,
}

/// Loads a user by id. Returns `Ok(None)` when no such user exists.
pub fn get_user(conn: &Connection, user_id: UserId) -> Result<Option<UserIdentity>, IdentityError> {
    let user = conn
        .query_row(
            "SELECT id, username, active FROM users WHERE id = ?1",
            [user_id.get()],
            |row| {
                Ok(UserIdentity {
                    id: UserId(row.get(0)?),
                    username: row.get(1)?,
                    active: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

/// Inserts an active user with an explicit id.
///
/// # Errors
///
/// Returns `IdentityError::Database` on constraint violations (duplicate id
/// or username).
pub fn create_user(
    conn: &Connection,
    user_id: UserId,
    username: &str,
) -> Result<UserIdentity, IdentityError> {
    conn.execute(
        "INSERT INTO users (id, username, active) VALUES (?1, ?2, 1)",
        params![user_id.get(), username],
    )?;
    get_user(conn, user_id)?.ok_or(IdentityError::UnknownUser(user_id))
}

/// Activates or deactivates a user. Returns whether a row was changed.
pub fn set_active(conn: &Connection, user_id: UserId, active: bool) -> Result<bool, IdentityError> {
    let changed = conn.execute(
        "UPDATE users SET active = ?1 WHERE id = ?2",
        params![active, user_id.get()],
    )?;
    Ok(changed > 0)
}
