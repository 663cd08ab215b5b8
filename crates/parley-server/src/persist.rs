//! Message persistence bridge.
//!
//! Store writes are blocking SQLite calls. They run on the blocking thread
//! pool and only the sending connection's task awaits them, so a slow disk
//! delays that sender and nobody else.

use parley_chat::{append_message, ChatError, Message};
use parley_db::DbPool;
use parley_types::UserId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("message store error: {0}")]
    Store(#[from] ChatError),
    #[error("persist task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Appends a chat message off the async runtime.
pub async fn persist_chat(
    pool: &DbPool,
    sender: UserId,
    receiver: UserId,
    body: String,
) -> Result<Message, PersistError> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        Ok(append_message(&conn, sender, receiver, &body)?)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_db::{create_pool, DbRuntimeSettings};

    #[tokio::test]
    async fn persists_on_the_blocking_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
        parley_db::run_migrations(&pool.get().unwrap()).unwrap();

        let msg = persist_chat(&pool, UserId(1), UserId(2), "hello".to_string())
            .await
            .expect("append should succeed");
        assert_eq!(msg.content, "hello");

        let conn = pool.get().unwrap();
        assert_eq!(parley_chat::get_message(&conn, msg.id).unwrap(), msg);
    }

    #[tokio::test]
    async fn store_failures_surface_as_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unmigrated.db");
        let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();

        let err = persist_chat(&pool, UserId(1), UserId(2), "hello".to_string())
            .await
            .expect_err("messages table is missing");
        assert!(matches!(err, PersistError::Store(ChatError::Database(_))));
    }
}
