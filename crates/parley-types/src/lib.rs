//! Shared identifiers and enums for the Parley gateway.
//!
//! Every other crate in the workspace talks about users, connections and
//! presence through the types defined here, so the wire representation of
//! each one is fixed in a single place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced when parsing identifiers from untrusted input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    /// The value is not a positive integer user id.
    #[error("invalid user id: {0}")]
    InvalidUserId(String),
}

/// Stable identity of an authenticated user.
///
/// Serializes as a bare integer, matching the ids issued by the account
/// service that owns the user table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl UserId {
    /// Returns the raw integer id.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = TypeError;

    /// Parses a positive decimal integer. Surrounding whitespace is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<i64>() {
            Ok(id) if id > 0 => Ok(Self(id)),
            _ => Err(TypeError::InvalidUserId(s.to_string())),
        }
    }
}

impl TryFrom<i64> for UserId {
    type Error = TypeError;

    fn try_from(id: i64) -> Result<Self, Self::Error> {
        if id > 0 {
            Ok(Self(id))
        } else {
            Err(TypeError::InvalidUserId(id.to_string()))
        }
    }
}

/// Identity of a single accepted transport session.
///
/// One user may hold many connections at once (several devices or tabs), so
/// presence and fan-out are keyed by this id rather than by [`UserId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Allocates a fresh random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Fleet-wide online status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// What a connection was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// One-to-one conversation with `peer`.
    Room { peer: UserId },
    /// Personal notification channel only.
    Notifications,
}

impl RouteKind {
    /// The peer of a one-to-one room, if any.
    pub fn peer(self) -> Option<UserId> {
        match self {
            Self::Room { peer } => Some(peer),
            Self::Notifications => None,
        }
    }
}
