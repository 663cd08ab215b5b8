//! Presence in Redis.
//!
//! `{prefix}presence:{user}` is the set of the user's open connection ids;
//! the user is online while the key exists. `{prefix}rooms:{user}` collects
//! the rooms the user joined while online. `{prefix}node:{node_id}` maps a
//! node's connection ids to their users so the node's registrations can be
//! released without it.
//!
//! Each node holds a lease, `{prefix}lease:{node_id}`, refreshed on every
//! heartbeat and listed in `{prefix}nodes`. A node whose lease expired has
//! crashed or lost Redis; the first survivor to notice releases its
//! registrations.

use super::{Departure, PresenceError};
use parley_types::{ConnectionId, UserId};
use redis::AsyncCommands;
use std::collections::HashMap;

/// Removes one connection id from the user's set and its node's hash. When
/// the set empties, returns the user's rooms and forgets them; otherwise
/// returns false (nil), also when the id was not a member, so repeated
/// releases are no-ops.
const RELEASE_SCRIPT: &str = r"
local removed = redis.call('SREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
if removed == 1 and redis.call('SCARD', KEYS[1]) == 0 then
  local rooms = redis.call('SMEMBERS', KEYS[3])
  redis.call('DEL', KEYS[3])
  return rooms
end
return false
";

#[derive(Clone)]
pub struct RedisPresence {
    conn: redis::aio::ConnectionManager,
    prefix: String,
    node_id: String,
}

impl RedisPresence {
    /// Connects and takes out this node's lease for `lease_secs`.
    pub async fn connect(
        url: &str,
        prefix: &str,
        node_id: &str,
        lease_secs: u64,
    ) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let store = Self {
            conn,
            prefix: prefix.to_string(),
            node_id: node_id.to_string(),
        };
        store.renew_lease(lease_secs).await?;
        Ok(store)
    }

    pub async fn increment(
        &self,
        user: UserId,
        connection: ConnectionId,
        room: Option<&str>,
    ) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let member = connection.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(user_key(&self.prefix, user), &member)
            .ignore()
            .hset(node_key(&self.prefix, &self.node_id), &member, user.get())
            .ignore();
        if let Some(room) = room {
            pipe.sadd(rooms_key(&self.prefix, user), room).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn decrement(
        &self,
        user: UserId,
        connection: ConnectionId,
    ) -> Result<Option<Vec<String>>, PresenceError> {
        self.release(&self.node_id, user, &connection.to_string())
            .await
    }

    async fn release(
        &self,
        node_id: &str,
        user: UserId,
        member: &str,
    ) -> Result<Option<Vec<String>>, PresenceError> {
        let mut conn = self.conn.clone();
        let mut rooms: Option<Vec<String>> = redis::Script::new(RELEASE_SCRIPT)
            .key(user_key(&self.prefix, user))
            .key(node_key(&self.prefix, node_id))
            .key(rooms_key(&self.prefix, user))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        if let Some(rooms) = rooms.as_mut() {
            rooms.sort();
        }
        Ok(rooms)
    }

    pub async fn contains(&self, user: UserId) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(user_key(&self.prefix, user)).await?;
        Ok(exists)
    }

    /// Releases what a previous run under this node id left behind.
    pub async fn purge_node(&self) -> Result<Vec<Departure>, PresenceError> {
        self.release_node(&self.node_id).await
    }

    /// Renews this node's lease, then reclaims every node whose lease ran
    /// out.
    pub async fn heartbeat(&self, lease_secs: u64) -> Result<Vec<Departure>, PresenceError> {
        self.renew_lease(lease_secs).await?;

        let mut conn = self.conn.clone();
        let nodes: Vec<String> = conn.smembers(nodes_key(&self.prefix)).await?;
        let others: Vec<String> = nodes
            .into_iter()
            .filter(|node| *node != self.node_id)
            .collect();
        if others.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for node in &others {
            pipe.exists(lease_key(&self.prefix, node));
        }
        let leased: Vec<bool> = pipe.query_async(&mut conn).await?;

        let mut departures = Vec::new();
        for node in expired_nodes(&others, &leased) {
            departures.extend(self.release_node(node).await?);
            conn.srem::<_, _, ()>(nodes_key(&self.prefix), node).await?;
            tracing::warn!(node_id = %node, "reclaimed presence of gateway node with expired lease");
        }
        Ok(departures)
    }

    async fn renew_lease(&self, lease_secs: u64) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .set_ex(lease_key(&self.prefix, &self.node_id), 1, lease_secs.max(1))
            .ignore()
            .sadd(nodes_key(&self.prefix), &self.node_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Releases every registration recorded for `node_id`. Concurrent callers
    /// are safe: the release script only reports a member it removed.
    async fn release_node(&self, node_id: &str) -> Result<Vec<Departure>, PresenceError> {
        let mut conn = self.conn.clone();
        let key = node_key(&self.prefix, node_id);
        let entries: HashMap<String, String> = conn.hgetall(&key).await?;

        let mut departures = Vec::new();
        for (member, entry) in entries {
            let Ok(user) = entry.parse::<UserId>() else {
                tracing::warn!(entry = %entry, "skipping unreadable presence entry");
                continue;
            };
            if let Some(rooms) = self.release(node_id, user, &member).await? {
                departures.push(Departure {
                    user,
                    rooms,
                    connection: member.parse().unwrap_or_default(),
                });
            }
        }
        conn.del::<_, ()>(&key).await?;
        Ok(departures)
    }
}

/// The nodes in `nodes` whose lease is gone. `leased` is parallel to `nodes`.
fn expired_nodes<'a>(nodes: &'a [String], leased: &[bool]) -> Vec<&'a str> {
    nodes
        .iter()
        .zip(leased)
        .filter(|(_, leased)| !**leased)
        .map(|(node, _)| node.as_str())
        .collect()
}

fn user_key(prefix: &str, user: UserId) -> String {
    format!("{prefix}presence:{user}")
}

fn rooms_key(prefix: &str, user: UserId) -> String {
    format!("{prefix}rooms:{user}")
}

fn node_key(prefix: &str, node_id: &str) -> String {
    format!("{prefix}node:{node_id}")
}

fn lease_key(prefix: &str, node_id: &str) -> String {
    format!("{prefix}lease:{node_id}")
}

fn nodes_key(prefix: &str) -> String {
    format!("{prefix}nodes")
}
