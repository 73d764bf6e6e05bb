//! Room/Signaling Core (SFU)
//!
//! WebRTC Selective Forwarding Unit for audio conferencing rooms.
//!
//! Signaling runs over WebSocket (see `session`). This module provides:
//! - Room, peer, and track registries with their locking discipline
//! - The signaling coordinator that converges every peer's sender set
//!   to the room's track set
//! - Per-connection session handling and RTP forwarding

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod messages;
pub mod peers;
pub mod rooms;
pub mod session;
pub mod tracks;

// Re-exports
pub use coordinator::Coordinator;
pub use error::SfuError;
pub use messages::{ClientJoin, ControlSender, ServerRegistration, SignalEvent, SignalMessage};
pub use peers::{PeerHandle, PeerRegistry};
pub use rooms::{Room, RoomRegistry};
pub use tracks::TrackRegistry;
