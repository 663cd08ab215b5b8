//! Fleet-wide presence tracking.
//!
//! Presence is keyed by connection: each open connection registers itself,
//! and a user is online while at least one registration exists anywhere in
//! the fleet. Only the release of the last registration reports the
//! online → offline transition, so two tabs closing at once cannot both
//! announce it and a tab closing while another opens cannot announce it
//! wrongly. That release also hands back every room the user joined while
//! online, and each of them hears the `offline`.

mod redis_store;
mod sqlite;

pub use redis_store::RedisPresence;
pub use sqlite::SqlitePresence;

use crate::fabric::{Fabric, FabricError};
use crate::frames::{Envelope, OutboundFrame};
use parley_types::{ConnectionId, PresenceStatus, UserId};
use thiserror::Error;

/// Errors raised by a presence store.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("presence task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A user who went offline because a whole node's registrations were
/// released, with the rooms they had joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user: UserId,
    pub rooms: Vec<String>,
    pub connection: ConnectionId,
}

/// The configured presence backend.
#[derive(Clone)]
pub enum PresenceStore {
    Sqlite(SqlitePresence),
    Redis(RedisPresence),
}

impl PresenceStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Redis(_) => "redis",
        }
    }

    /// Registers one open connection of `user`.
    pub async fn increment(
        &self,
        user: UserId,
        connection: ConnectionId,
        room: Option<&str>,
    ) -> Result<(), PresenceError> {
        match self {
            Self::Sqlite(store) => store.increment(user, connection, room).await,
            Self::Redis(store) => store.increment(user, connection, room).await,
        }
    }

    /// Releases one connection. Only when it was the user's last
    /// registration does this return the rooms the user joined while online;
    /// releasing an unknown connection returns `None`.
    pub async fn decrement(
        &self,
        user: UserId,
        connection: ConnectionId,
    ) -> Result<Option<Vec<String>>, PresenceError> {
        match self {
            Self::Sqlite(store) => store.decrement(user, connection).await,
            Self::Redis(store) => store.decrement(user, connection).await,
        }
    }

    /// Whether `user` has at least one open connection anywhere.
    pub async fn contains(&self, user: UserId) -> Result<bool, PresenceError> {
        match self {
            Self::Sqlite(store) => store.contains(user).await,
            Self::Redis(store) => store.contains(user).await,
        }
    }

    /// Refreshes this node's liveness and reclaims registrations of nodes
    /// that have not refreshed theirs for `stale_after_secs`.
    pub async fn heartbeat(&self, stale_after_secs: u64) -> Result<Vec<Departure>, PresenceError> {
        match self {
            Self::Sqlite(store) => store.heartbeat(stale_after_secs).await,
            Self::Redis(store) => store.heartbeat(stale_after_secs).await,
        }
    }

    /// Releases every registration this node left behind in a previous run.
    pub async fn purge_node(&self) -> Result<Vec<Departure>, PresenceError> {
        match self {
            Self::Sqlite(store) => store.purge_node().await,
            Self::Redis(store) => store.purge_node().await,
        }
    }
}

fn presence_envelope(user: UserId, connection: ConnectionId, status: PresenceStatus) -> Envelope {
    Envelope {
        origin_user: user,
        origin_connection: connection,
        self_exclude: false,
        echoed_by_origin: false,
        frame: OutboundFrame::Presence {
            user_id: user,
            status,
        },
    }
}

/// Publishes `user`'s online status to `room`.
pub async fn announce_online(
    fabric: &Fabric,
    room: &str,
    user: UserId,
    connection: ConnectionId,
) -> Result<(), FabricError> {
    fabric
        .publish(room, presence_envelope(user, connection, PresenceStatus::Online))
        .await
}

/// Registers a newly opened connection and announces it.
///
/// Every open broadcasts `online` to the room, and a probe asks the other
/// members to announce themselves back, so a late joiner learns who is
/// already there. Notification-only connections register but broadcast
/// nothing.
pub async fn mark_online(
    store: &PresenceStore,
    fabric: &Fabric,
    user: UserId,
    connection: ConnectionId,
    room: Option<&str>,
) -> Result<(), crate::error::GatewayError> {
    store.increment(user, connection, room).await?;

    if let Some(room) = room {
        announce_online(fabric, room, user, connection).await?;
        fabric
            .publish(
                room,
                Envelope {
                    origin_user: user,
                    origin_connection: connection,
                    self_exclude: true,
                    echoed_by_origin: false,
                    frame: OutboundFrame::PresenceProbe,
                },
            )
            .await?;
    }
    Ok(())
}

/// Releases a closing connection and, if it was the user's last one,
/// broadcasts `offline` to every room the user joined while online.
///
/// The release stands even when an announcement cannot be published.
/// Returns whether the user went offline.
pub async fn mark_offline(
    store: &PresenceStore,
    fabric: &Fabric,
    user: UserId,
    connection: ConnectionId,
) -> Result<bool, PresenceError> {
    let Some(rooms) = store.decrement(user, connection).await? else {
        return Ok(false);
    };
    announce_offline(fabric, user, connection, &rooms).await;
    Ok(true)
}

/// Broadcasts `offline` for users released in bulk.
pub async fn announce_departures(fabric: &Fabric, departures: &[Departure]) {
    for departure in departures {
        announce_offline(fabric, departure.user, departure.connection, &departure.rooms).await;
    }
}

async fn announce_offline(fabric: &Fabric, user: UserId, connection: ConnectionId, rooms: &[String]) {
    for room in rooms {
        let envelope = presence_envelope(user, connection, PresenceStatus::Offline);
        if let Err(e) = fabric.publish(room, envelope).await {
            tracing::warn!(
                user_id = %user,
                group = %room,
                "failed to announce offline: {}",
                e
            );
        }
    }
}
