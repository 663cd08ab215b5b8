//! Identity resolution for gateway connections.
//!
//! A connection presents an opaque bearer credential (the `token` query
//! parameter). This crate verifies the credential's signature and expiry and
//! resolves it to a [`UserIdentity`] from the `users` table.

mod token;
mod users;

pub use token::{issue_token, verify_token, TokenSecret};
pub use users::{create_user, get_user, set_active, UserIdentity};

use parley_types::UserId;
use rusqlite::Connection;
use thiserror::Error;

/// Errors produced while resolving a credential.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The credential is not valid base64 or lacks the expected fields.
    #[error("malformed credential")]
    Malformed,
    /// The signature does not match the payload.
    #[error("credential signature mismatch")]
    BadSignature,
    /// The credential was valid once but its lifetime has passed.
    #[error("credential expired")]
    Expired,
    /// The credential names a user that does not exist.
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    /// The user exists but has been deactivated.
    #[error("inactive user: {0}")]
    Inactive(UserId),
    /// The user lookup itself failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl IdentityError {
    /// Whether the failure is the caller's fault rather than ours.
    ///
    /// Database errors are internal; everything else is an authentication
    /// failure and must not reveal which check failed to the client.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Database(_))
    }
}

/// Verifies `token` and loads the active user it names.
///
/// Blocking: call from `spawn_blocking` in async contexts.
///
/// # Errors
///
/// Returns the first failing check as an [`IdentityError`].
pub fn resolve(
    conn: &Connection,
    token: &str,
    secret: &TokenSecret,
) -> Result<UserIdentity, IdentityError> {
    let user_id = verify_token(token, secret)?;
    let identity = get_user(conn, user_id)?.ok_or(IdentityError::UnknownUser(user_id))?;
    if !identity.active {
        tracing::debug!(user_id = %user_id, "credential names an inactive user");
        return Err(IdentityError::Inactive(user_id));
    }
    Ok(identity)
}
