//! Presence rows in the shared SQLite database.
//!
//! One row per open connection. A user is online while any row carries
//! their id, so the count is implicit and cannot drift below zero. The rooms
//! a user joined while online are kept alongside and handed back when the
//! last row goes.

use super::{Departure, PresenceError};
use parley_db::DbPool;
use parley_types::{ConnectionId, UserId};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::sync::Arc;

/// Async handle over the blocking functions below.
#[derive(Clone)]
pub struct SqlitePresence {
    pool: DbPool,
    node_id: Arc<str>,
}

impl SqlitePresence {
    pub fn new(pool: DbPool, node_id: &str) -> Self {
        Self {
            pool,
            node_id: Arc::from(node_id),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PresenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let node_id = Arc::clone(&self.node_id);
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok(f(&*conn, node_id.as_ref())?)
        })
        .await?
    }

    pub async fn increment(
        &self,
        user: UserId,
        connection: ConnectionId,
        room: Option<&str>,
    ) -> Result<(), PresenceError> {
        let room = room.map(str::to_string);
        self.with_conn(move |conn, node_id| {
            insert_connection(conn, connection, user, node_id, room.as_deref())
        })
        .await
    }

    pub async fn decrement(
        &self,
        user: UserId,
        connection: ConnectionId,
    ) -> Result<Option<Vec<String>>, PresenceError> {
        self.with_conn(move |conn, _| remove_connection(conn, connection, user))
            .await
    }

    pub async fn contains(&self, user: UserId) -> Result<bool, PresenceError> {
        self.with_conn(move |conn, _| user_online(conn, user)).await
    }

    pub async fn purge_node(&self) -> Result<Vec<Departure>, PresenceError> {
        self.with_conn(|conn, node_id| purge_node(conn, node_id)).await
    }

    /// Refreshes this node's liveness and reclaims nodes that stopped
    /// refreshing theirs.
    pub async fn heartbeat(&self, stale_after_secs: u64) -> Result<Vec<Departure>, PresenceError> {
        self.with_conn(move |conn, node_id| {
            let now = chrono::Utc::now().timestamp();
            touch_node(conn, node_id, now)?;
            reclaim_stale_nodes(conn, node_id, now, stale_after_secs)
        })
        .await
    }
}

pub(crate) fn insert_connection(
    conn: &Connection,
    connection: ConnectionId,
    user: UserId,
    node_id: &str,
    room: Option<&str>,
) -> rusqlite::Result<()> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO presence_connections (connection_id, user_id, node_id)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(connection_id) DO NOTHING",
        params![connection.to_string(), user.get(), node_id],
    )?;
    if let Some(room) = room {
        tx.execute(
            "INSERT OR IGNORE INTO presence_rooms (user_id, room) VALUES (?1, ?2)",
            params![user.get(), room],
        )?;
    }
    tx.commit()
}

/// Deletes one connection row. When that row was the user's last one,
/// returns the rooms they had joined and forgets them; otherwise, and for an
/// unknown connection, returns `None`.
pub(crate) fn remove_connection(
    conn: &Connection,
    connection: ConnectionId,
    user: UserId,
) -> rusqlite::Result<Option<Vec<String>>> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let removed = tx.execute(
        "DELETE FROM presence_connections WHERE connection_id = ?1 AND user_id = ?2",
        params![connection.to_string(), user.get()],
    )?;
    let rooms = if removed > 0 && !user_online(&tx, user)? {
        Some(take_rooms(&tx, user)?)
    } else {
        None
    };
    tx.commit()?;
    Ok(rooms)
}

fn take_rooms(tx: &Transaction, user: UserId) -> rusqlite::Result<Vec<String>> {
    let rooms = {
        let mut stmt =
            tx.prepare("SELECT room FROM presence_rooms WHERE user_id = ?1 ORDER BY room")?;
        let rows = stmt.query_map([user.get()], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()?
    };
    tx.execute("DELETE FROM presence_rooms WHERE user_id = ?1", [user.get()])?;
    Ok(rooms)
}

pub(crate) fn user_online(conn: &Connection, user: UserId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM presence_connections WHERE user_id = ?1)",
        [user.get()],
        |row| row.get(0),
    )
}

/// Drops every row left behind by `node_id`.
pub(crate) fn purge_node(conn: &Connection, node_id: &str) -> rusqlite::Result<Vec<Departure>> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let departures = release_node(&tx, node_id)?;
    tx.commit()?;
    Ok(departures)
}

pub(crate) fn touch_node(conn: &Connection, node_id: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO gateway_nodes (node_id, last_seen_at) VALUES (?1, ?2)
         ON CONFLICT(node_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        params![node_id, now],
    )?;
    Ok(())
}

/// Releases the rows of every other node whose heartbeat is older than
/// `stale_after_secs`.
pub(crate) fn reclaim_stale_nodes(
    conn: &Connection,
    self_node: &str,
    now: i64,
    stale_after_secs: u64,
) -> rusqlite::Result<Vec<Departure>> {
    let cutoff = now.saturating_sub(i64::try_from(stale_after_secs).unwrap_or(i64::MAX));
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let stale: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT node_id FROM gateway_nodes WHERE node_id != ?1 AND last_seen_at < ?2",
        )?;
        let rows = stmt.query_map(params![self_node, cutoff], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()?
    };

    let mut departures = Vec::new();
    for node_id in &stale {
        departures.extend(release_node(&tx, node_id)?);
        tx.execute("DELETE FROM gateway_nodes WHERE node_id = ?1", [node_id])?;
        tracing::warn!(node_id = %node_id, "reclaimed presence of stale gateway node");
    }
    tx.commit()?;
    Ok(departures)
}

/// Deletes every row of `node_id` and returns one departure per user left
/// with no connection anywhere.
fn release_node(tx: &Transaction, node_id: &str) -> rusqlite::Result<Vec<Departure>> {
    let rows: Vec<(String, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT connection_id, user_id FROM presence_connections
             WHERE node_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map([node_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    tx.execute(
        "DELETE FROM presence_connections WHERE node_id = ?1",
        [node_id],
    )?;

    let mut departures: Vec<Departure> = Vec::new();
    for (connection_id, user_id) in rows {
        let user = UserId(user_id);
        if departures.last().is_some_and(|d| d.user == user) || user_online(tx, user)? {
            continue;
        }
        departures.push(Departure {
            user,
            rooms: take_rooms(tx, user)?,
            connection: connection_id.parse().unwrap_or_default(),
        });
    }
    Ok(departures)
}
