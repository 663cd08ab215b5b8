//! Publish/subscribe fabric.
//!
//! Connections attach to the local table and subscribe to named groups.
//! Publishing goes through the configured transport: straight into the local
//! table for a single process, or through Redis so that every gateway process
//! receives the event and delivers it to its own local members.

pub mod local;
pub mod redis_bus;

pub use local::LocalFabric;
pub use redis_bus::RedisBus;

use crate::frames::Envelope;
use parley_types::ConnectionId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by the fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection {0} is not attached to the fabric")]
    Detached(ConnectionId),
    #[error("fabric transport is down")]
    Unavailable,
}

#[derive(Clone)]
enum Transport {
    Local,
    Redis(RedisBus),
}

/// Handle to the fabric shared by every connection of this process.
#[derive(Clone)]
pub struct Fabric {
    local: LocalFabric,
    transport: Transport,
}

impl Fabric {
    /// In-process fabric. Events never leave this process.
    pub fn local(mailbox_capacity: usize) -> Self {
        Self {
            local: LocalFabric::new(mailbox_capacity),
            transport: Transport::Local,
        }
    }

    /// Fleet-wide fabric over Redis.
    pub async fn redis(url: &str, prefix: &str, mailbox_capacity: usize) -> Result<Self, FabricError> {
        let local = LocalFabric::new(mailbox_capacity);
        let bus = RedisBus::connect(url, prefix, local.clone()).await?;
        Ok(Self {
            local,
            transport: Transport::Redis(bus),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self.transport {
            Transport::Local => "local",
            Transport::Redis(_) => "redis",
        }
    }

    /// Whether the transport is up. False from the moment a Redis listener
    /// is lost until it resubscribes.
    pub fn is_available(&self) -> bool {
        self.local.is_available()
    }

    /// The process-local delivery table.
    pub fn local_table(&self) -> &LocalFabric {
        &self.local
    }

    pub async fn attach(&self, connection: ConnectionId) -> mpsc::Receiver<Arc<Envelope>> {
        self.local.attach(connection).await
    }

    pub async fn subscribe(&self, group: &str, connection: ConnectionId) -> Result<(), FabricError> {
        self.local.subscribe(group, connection).await?;
        tracing::debug!(group = %group, connection_id = %connection, "subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, group: &str, connection: ConnectionId) {
        self.local.unsubscribe(group, connection).await;
    }

    pub async fn detach(&self, connection: ConnectionId) {
        self.local.detach(connection).await;
    }

    /// Publishes `envelope` to every subscriber of `group`, fleet-wide.
    ///
    /// # Errors
    ///
    /// `FabricError::Unavailable` while the fabric is closed. The Redis
    /// transport can also fail on the publish itself.
    pub async fn publish(&self, group: &str, envelope: Envelope) -> Result<(), FabricError> {
        if !self.is_available() {
            return Err(FabricError::Unavailable);
        }
        match &self.transport {
            Transport::Local => {
                self.local.deliver(group, Arc::new(envelope)).await;
                Ok(())
            }
            Transport::Redis(bus) => bus.publish(group, &envelope).await,
        }
    }
}
