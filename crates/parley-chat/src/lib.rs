//! Durable, append-only storage for one-to-one chat messages.
//!
//! Messages are immutable once written except for the read flag. Rows are
//! keyed by the sender/receiver pair and carry a server-assigned RFC 3339
//! timestamp; history for a conversation is the union of both directions
//! in the order the store accepted the writes.
//!
//! All functions here are blocking and take a plain `rusqlite::Connection`.
//! Async callers run them on the blocking thread pool.
//!
//! Ordering between concurrent writers in the same conversation is the order
//! in which SQLite accepted the inserts. There is no global sequencer, so two
//! near-simultaneous senders may be persisted in a different order than they
//! pressed send.

use chrono::{SecondsFormat, Utc};
use parley_types::UserId;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default page size for [`list_between`].
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Hard cap on the page size for [`list_between`].
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// Errors that can occur during message store operations.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("message not found: {0}")]
    NotFound(i64),
    #[error("message body cannot be empty")]
    EmptyBody,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id.
    pub id: i64,
    pub sender: UserId,
    pub receiver: UserId,
    /// Message text.
    pub content: String,
    /// Creation time (RFC 3339, UTC, microsecond precision).
    pub timestamp: String,
    pub is_read: bool,
}

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, timestamp, is_read";

/// Current time in the format stored in `messages.timestamp`.
///
/// Fixed-width UTC so lexical order equals chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Appends a message from `sender` to `receiver`.
///
/// # Errors
///
/// Returns `ChatError::EmptyBody` for an empty body, or a database error.
pub fn append_message(
    conn: &Connection,
    sender: UserId,
    receiver: UserId,
    body: &str,
) -> Result<Message, ChatError> {
    if body.is_empty() {
        return Err(ChatError::EmptyBody);
    }

    let sql = format!(
        "INSERT INTO messages (sender_id, receiver_id, content, timestamp)
         VALUES (?1, ?2, ?3, ?4)
         RETURNING {MESSAGE_COLUMNS}"
    );
    let message = conn.query_row(
        &sql,
        params![sender.get(), receiver.get(), body, now_timestamp()],
        map_row_to_message,
    )?;

    tracing::debug!(
        message_id = message.id,
        sender = %sender,
        receiver = %receiver,
        "message appended"
    );
    Ok(message)
}

/// Retrieves a message by id.
pub fn get_message(conn: &Connection, id: i64) -> Result<Message, ChatError> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id],
        map_row_to_message,
    )
    .optional()?
    .ok_or(ChatError::NotFound(id))
}

/// Lists the conversation between `a` and `b` in store acceptance order.
///
/// `before` is a message id cursor: only messages accepted before it are
/// considered, and the page holds the newest `limit` of them. `limit`
/// defaults to [`DEFAULT_HISTORY_LIMIT`] and is capped at
/// [`MAX_HISTORY_LIMIT`].
pub fn list_between(
    conn: &Connection,
    a: UserId,
    b: UserId,
    before: Option<i64>,
    limit: Option<u32>,
) -> Result<Vec<Message>, ChatError> {
    let limit = limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    // Newest page first, reversed below so callers get chronological order.
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS}
         FROM messages
         WHERE ((sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1))
           AND (?3 IS NULL OR id < ?3)
         ORDER BY id DESC
         LIMIT ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![a.get(), b.get(), before, limit],
        map_row_to_message,
    )?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    messages.reverse();
    Ok(messages)
}

/// Marks every unread message sent by `other` to `reader` as read.
///
/// Returns the number of messages updated.
pub fn mark_read(conn: &Connection, reader: UserId, other: UserId) -> Result<usize, ChatError> {
    let count = conn.execute(
        "UPDATE messages SET is_read = 1
         WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
        params![reader.get(), other.get()],
    )?;
    Ok(count)
}

/// Number of unread messages addressed to `reader`.
pub fn unread_count(conn: &Connection, reader: UserId) -> Result<u64, ChatError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
        [reader.get()],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        sender: UserId(row.get(1)?),
        receiver: UserId(row.get(2)?),
        content: row.get(3)?,
        timestamp: row.get(4)?,
        is_read: row.get(5)?,
    })
}
