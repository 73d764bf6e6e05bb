//! SFU Error Types

use thiserror::Error;

/// Errors that can occur during room, signaling, and session operations.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Server ID is registered with a different password.
    #[error("server {0} is already registered with a different password")]
    AuthMismatch(String),

    /// Server ID was never registered.
    #[error("server {0} is not registered")]
    ServerUnknown(String),

    /// Room exists but is owned by a different server.
    #[error("room {0} belongs to a different server")]
    RoomOwnership(String),

    /// Room is not in the registry.
    #[error("room {0} does not exist")]
    RoomNotFound(String),

    /// Malformed control-channel payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Process-wide peer cap reached.
    #[error("no seats left ({current}/{max})")]
    CapacityExceeded {
        /// Peers currently connected across all rooms.
        current: usize,
        /// Configured cap.
        max: usize,
    },

    /// Media-plane setup or negotiation failure.
    #[error("media setup failed: {0}")]
    MediaSetup(String),

    /// Control channel closed underneath a write.
    #[error("control channel closed")]
    TransportClosed,

    /// Unexpected internal fault.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<webrtc::Error> for SfuError {
    fn from(err: webrtc::Error) -> Self {
        Self::MediaSetup(err.to_string())
    }
}

impl From<serde_json::Error> for SfuError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
