//! Background tasks for the gateway.
//!
//! Includes:
//! - Presence heartbeat and reclamation of crashed nodes.

use crate::presence::announce_departures;
use crate::AppState;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Starts the presence heartbeat task.
///
/// Runs indefinitely. Each tick refreshes this node's liveness and releases
/// the registrations of nodes whose liveness is older than
/// `stale_after_secs`, announcing `offline` for users left with no
/// connection.
pub async fn start_presence_heartbeat(state: Arc<AppState>, interval_secs: u64, stale_after_secs: u64) {
    if interval_secs == 0 {
        tracing::warn!("presence heartbeat disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_secs);

    tracing::info!(
        node_id = %state.node_id,
        interval_secs,
        stale_after_secs,
        backend = state.presence.backend_name(),
        "starting presence heartbeat"
    );

    loop {
        match state.presence.heartbeat(stale_after_secs).await {
            Ok(departures) => {
                if !departures.is_empty() {
                    tracing::info!(count = departures.len(), "released presence of stale nodes");
                    announce_departures(&state.fabric, &departures).await;
                }
            }
            Err(e) => {
                tracing::error!("presence heartbeat failed: {}", e);
            }
        }

        sleep(interval).await;
    }
}
