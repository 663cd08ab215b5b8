//! Deterministic group names.
//!
//! Both participants of a conversation must land in the same group no matter
//! who connects first, so room names sort the two identities.

use parley_types::{RouteKind, UserId};

/// Prefix of every one-to-one room group.
pub const ROOM_PREFIX: &str = "chat_";

/// Prefix of every personal notification channel.
pub const NOTIFY_PREFIX: &str = "notify_";

/// Room group for the conversation between `a` and `b`.
///
/// `room_name(a, b) == room_name(b, a)` for all inputs.
pub fn room_name(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{ROOM_PREFIX}{lo}_{hi}")
}

/// Personal notification channel of `user`.
pub fn notify_channel(user: UserId) -> String {
    format!("{NOTIFY_PREFIX}{user}")
}

/// The one group a connection joins: its room when the route names a peer,
/// otherwise the user's notification channel.
pub fn home_group(user: UserId, route: RouteKind) -> String {
    match route {
        RouteKind::Room { peer } => room_name(user, peer),
        RouteKind::Notifications => notify_channel(user),
    }
}
