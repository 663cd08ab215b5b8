//! Redis transport for the fabric.
//!
//! Publishing is a plain `PUBLISH {prefix}group:{name}`. One listener per
//! process pattern-subscribes to every group channel and hands each envelope
//! to the local table, which only delivers to groups that have local members.
//!
//! Losing the listener closes every local connection and marks the fabric
//! unavailable. The listener then resubscribes with exponential backoff and
//! reopens the local table once it is back.

use super::local::LocalFabric;
use super::FabricError;
use crate::frames::Envelope;
use futures_util::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

/// Channel segment between the prefix and the group name.
const GROUP_SEGMENT: &str = "group:";

/// First wait before resubscribing after the listener is lost.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the resubscribe backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Publishing half of the Redis transport.
#[derive(Clone)]
pub struct RedisBus {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisBus {
    /// Connects, subscribes to every group channel under `prefix` and spawns
    /// the listener that feeds `local`.
    ///
    /// # Errors
    ///
    /// Returns `FabricError::Redis` if either connection cannot be opened.
    pub async fn connect(url: &str, prefix: &str, local: LocalFabric) -> Result<Self, FabricError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;

        let pattern = format!("{prefix}{GROUP_SEGMENT}*");
        let pubsub = subscribe_groups(&client, &pattern).await?;
        tracing::info!(pattern = %pattern, "subscribed to fabric channels");

        tokio::spawn(run_listener(client, pattern, pubsub, prefix.to_string(), local));

        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    /// Publishes an envelope to every process subscribed to `group`.
    pub async fn publish(&self, group: &str, envelope: &Envelope) -> Result<(), FabricError> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel_for(&self.prefix, group), payload)
            .await?;
        Ok(())
    }
}

async fn subscribe_groups(
    client: &redis::Client,
    pattern: &str,
) -> Result<redis::aio::PubSub, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(pattern).await?;
    Ok(pubsub)
}

async fn run_listener(
    client: redis::Client,
    pattern: String,
    pubsub: redis::aio::PubSub,
    prefix: String,
    local: LocalFabric,
) {
    let mut pubsub = pubsub;
    loop {
        forward_messages(pubsub, &prefix, &local).await;

        tracing::error!("fabric listener disconnected; closing local connections");
        local.close_all().await;

        let mut reconnect_delay = RECONNECT_DELAY;
        pubsub = loop {
            tokio::time::sleep(reconnect_delay).await;
            match subscribe_groups(&client, &pattern).await {
                Ok(pubsub) => break pubsub,
                Err(e) => {
                    reconnect_delay = next_delay(reconnect_delay);
                    tracing::warn!(
                        retry_in_ms = reconnect_delay.as_millis() as u64,
                        "fabric resubscribe failed: {}",
                        e
                    );
                }
            }
        };
        local.reopen().await;
        tracing::info!(pattern = %pattern, "fabric listener resubscribed");
    }
}

/// Delivers messages until the pubsub connection ends.
async fn forward_messages(pubsub: redis::aio::PubSub, prefix: &str, local: &LocalFabric) {
    let mut messages = pubsub.into_on_message();
    while let Some(msg) = messages.next().await {
        let Some(group) = group_from_channel(prefix, msg.get_channel_name()) else {
            continue;
        };
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(group = %group, "unreadable fabric payload: {}", e);
                continue;
            }
        };
        match decode_envelope(&payload) {
            Ok(envelope) => {
                local.deliver(group, Arc::new(envelope)).await;
            }
            Err(e) => {
                tracing::warn!(group = %group, "discarding malformed fabric envelope: {}", e);
            }
        }
    }
}

/// Exponential backoff, capped at [`MAX_RECONNECT_DELAY`].
fn next_delay(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RECONNECT_DELAY)
}

/// Redis channel carrying `group`.
pub(crate) fn channel_for(prefix: &str, group: &str) -> String {
    format!("{prefix}{GROUP_SEGMENT}{group}")
}

/// Inverse of [`channel_for`].
pub(crate) fn group_from_channel<'a>(prefix: &str, channel: &'a str) -> Option<&'a str> {
    channel
        .strip_prefix(prefix)?
        .strip_prefix(GROUP_SEGMENT)
        .filter(|group| !group.is_empty())
}

pub(crate) fn decode_envelope(payload: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(payload)
}
