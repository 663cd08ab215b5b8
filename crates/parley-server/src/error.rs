//! Gateway failure taxonomy.
//!
//! Authentication failures never reach an open socket: they reject the
//! upgrade. Protocol and persistence failures are reported to the sender
//! alone and the connection stays open. Fabric failures end the connection.

use crate::fabric::FabricError;
use crate::frames::{ErrorCode, OutboundFrame, ProtocolViolation};
use crate::persist::PersistError;
use crate::presence::PresenceError;
use parley_identity::IdentityError;
use thiserror::Error;

/// WebSocket close code sent when the shared substrate is unavailable.
pub const FABRIC_FAILURE_CLOSE_CODE: u16 = 1011;

/// WebSocket close reason sent when the shared substrate is unavailable.
pub const FABRIC_FAILURE_REASON: &str = "fabric unavailable";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] IdentityError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("message not persisted: {0}")]
    Persistence(#[from] PersistError),
    #[error("fabric failure: {0}")]
    Fabric(#[from] FabricError),
    #[error("presence store failure: {0}")]
    Presence(#[from] PresenceError),
}

impl GatewayError {
    /// Whether the connection must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_) | Self::Fabric(_) | Self::Presence(_)
        )
    }

    /// The error frame reported to the sender, for recoverable errors.
    pub fn to_frame(&self) -> Option<OutboundFrame> {
        let (code, message) = match self {
            Self::Protocol(ProtocolViolation::NotInRoom(_)) => {
                (ErrorCode::NotInRoom, self.to_string())
            }
            Self::Protocol(_) => (ErrorCode::ProtocolViolation, self.to_string()),
            // Store internals stay in the server log.
            Self::Persistence(_) => (
                ErrorCode::PersistenceFailure,
                "message was delivered but not saved".to_string(),
            ),
            Self::Authentication(_) | Self::Fabric(_) | Self::Presence(_) => return None,
        };
        Some(OutboundFrame::Error { code, message })
    }
}
