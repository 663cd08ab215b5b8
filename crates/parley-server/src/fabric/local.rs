//! The per-process delivery table.
//!
//! Every connection owns one bounded mailbox. Groups map to the set of
//! connections subscribed to them; a group that loses its last member is
//! removed, which is how a room ceases to exist.

use crate::frames::Envelope;
use parley_types::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use super::FabricError;

type Mailbox = mpsc::Sender<Arc<Envelope>>;

/// Local half of the fabric: group membership and mailboxes of the
/// connections hosted by this process.
///
/// Lock ordering: mailboxes → group_members → connection_groups.
#[derive(Clone)]
pub struct LocalFabric {
    capacity: usize,
    /// Cleared by `close_all` while the transport is down. Only flipped with
    /// the mailboxes write lock held.
    available: Arc<AtomicBool>,
    /// Open connections and their mailboxes.
    mailboxes: Arc<RwLock<HashMap<ConnectionId, Mailbox>>>,
    /// group -> connections subscribed to it.
    group_members: Arc<RwLock<HashMap<String, HashSet<ConnectionId>>>>,
    /// Reverse mapping: connection -> groups it joined.
    connection_groups: Arc<RwLock<HashMap<ConnectionId, HashSet<String>>>>,
}

impl LocalFabric {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            available: Arc::new(AtomicBool::new(true)),
            mailboxes: Arc::new(RwLock::new(HashMap::new())),
            group_members: Arc::new(RwLock::new(HashMap::new())),
            connection_groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a connection and returns the receiving end of its mailbox.
    pub async fn attach(&self, connection: ConnectionId) -> mpsc::Receiver<Arc<Envelope>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.mailboxes.write().await.insert(connection, tx);
        rx
    }

    /// Adds an attached connection to `group`.
    ///
    /// # Errors
    ///
    /// `FabricError::Unavailable` while the fabric is closed, and
    /// `FabricError::Detached` if the connection has no mailbox, either
    /// because it never attached or because the fabric was shut down.
    pub async fn subscribe(&self, group: &str, connection: ConnectionId) -> Result<(), FabricError> {
        let mailboxes = self.mailboxes.read().await;
        if !self.is_available() {
            return Err(FabricError::Unavailable);
        }
        if !mailboxes.contains_key(&connection) {
            return Err(FabricError::Detached(connection));
        }

        let mut members = self.group_members.write().await;
        members
            .entry(group.to_string())
            .or_default()
            .insert(connection);

        let mut groups = self.connection_groups.write().await;
        groups
            .entry(connection)
            .or_default()
            .insert(group.to_string());
        Ok(())
    }

    /// Removes a connection from `group`, dropping the group if it empties.
    pub async fn unsubscribe(&self, group: &str, connection: ConnectionId) {
        let mut members = self.group_members.write().await;
        if let Some(listeners) = members.get_mut(group) {
            listeners.remove(&connection);
            if listeners.is_empty() {
                members.remove(group);
            }
        }

        let mut groups = self.connection_groups.write().await;
        if let Some(joined) = groups.get_mut(&connection) {
            joined.remove(group);
            if joined.is_empty() {
                groups.remove(&connection);
            }
        }
    }

    /// Removes a connection's mailbox and every subscription it holds.
    ///
    /// Safe to call more than once.
    pub async fn detach(&self, connection: ConnectionId) {
        let mut mailboxes = self.mailboxes.write().await;
        mailboxes.remove(&connection);

        let mut members = self.group_members.write().await;
        let mut groups = self.connection_groups.write().await;
        if let Some(joined) = groups.remove(&connection) {
            for group in joined {
                if let Some(listeners) = members.get_mut(&group) {
                    listeners.remove(&connection);
                    if listeners.is_empty() {
                        members.remove(&group);
                    }
                }
            }
        }
    }

    /// Delivers an envelope to every local member of `group`.
    ///
    /// A full mailbox drops the event for that consumer only. Returns the
    /// number of mailboxes that accepted it.
    pub async fn deliver(&self, group: &str, envelope: Arc<Envelope>) -> usize {
        let mailboxes = self.mailboxes.read().await;
        let members = self.group_members.read().await;
        let Some(listeners) = members.get(group) else {
            return 0;
        };

        let mut delivered = 0;
        for connection in listeners {
            let Some(tx) = mailboxes.get(connection) else {
                continue;
            };
            match tx.try_send(Arc::clone(&envelope)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %connection,
                        group = %group,
                        "dropping event for slow consumer: {}",
                        e
                    );
                }
            }
        }
        delivered
    }

    /// Drops every mailbox, ending each connection's receive loop, and
    /// refuses new subscriptions until [`reopen`](Self::reopen).
    pub async fn close_all(&self) {
        let mut mailboxes = self.mailboxes.write().await;
        self.available.store(false, Ordering::SeqCst);
        let count = mailboxes.len();
        mailboxes.clear();

        let mut members = self.group_members.write().await;
        members.clear();
        let mut groups = self.connection_groups.write().await;
        groups.clear();

        tracing::warn!(connections = count, "closed all local mailboxes");
    }

    /// Accepts subscriptions again after `close_all`.
    pub async fn reopen(&self) {
        let _mailboxes = self.mailboxes.write().await;
        self.available.store(true, Ordering::SeqCst);
        tracing::info!("local fabric reopened");
    }

    /// Whether the fabric currently accepts subscriptions and publishes.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of local connections subscribed to `group`.
    pub async fn group_size(&self, group: &str) -> usize {
        self.group_members
            .read()
            .await
            .get(group)
            .map_or(0, HashSet::len)
    }

    /// Number of groups with at least one local member.
    pub async fn group_count(&self) -> usize {
        self.group_members.read().await.len()
    }

    /// Number of attached connections.
    pub async fn connection_count(&self) -> usize {
        self.mailboxes.read().await.len()
    }
}
