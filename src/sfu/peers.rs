//! Peer Registry
//!
//! Media-plane mirror of each room's membership. Holds the same peers as
//! the room registry but is keyed for the forwarding side, so media-plane
//! callbacks never traverse the room registry's locks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use super::messages::ControlSender;

/// A peer's media session together with its control channel.
#[derive(Clone)]
pub struct PeerHandle {
    pub pc: Arc<RTCPeerConnection>,
    pub control: ControlSender,
}

/// Per-room peer table, keyed `(roomID, clientID)`.
#[derive(Default)]
pub struct PeerRegistry {
    /// Map: roomID -> clientID -> peer handle
    rooms: RwLock<HashMap<String, HashMap<String, PeerHandle>>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to a room, creating the room bucket on demand.
    pub async fn add(
        &self,
        room_id: &str,
        client_id: &str,
        pc: Arc<RTCPeerConnection>,
        control: ControlSender,
    ) {
        let mut rooms = self.rooms.write().await;
        let bucket = rooms.entry(room_id.to_string()).or_default();
        bucket.insert(client_id.to_string(), PeerHandle { pc, control });

        debug!(
            room_id,
            client_id,
            room_peers = bucket.len(),
            "Added peer to media-plane registry"
        );
    }

    /// Remove a peer from a room. Idempotent; drops the room bucket once it
    /// empties.
    pub async fn remove(&self, room_id: &str, client_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(bucket) = rooms.get_mut(room_id) else {
            return;
        };

        if bucket.remove(client_id).is_some() {
            debug!(
                room_id,
                client_id,
                remaining = bucket.len(),
                "Removed peer from media-plane registry"
            );
        }

        if bucket.is_empty() {
            rooms.remove(room_id);
        }
    }

    /// Shallow snapshot of a room's peers.
    pub async fn snapshot(&self, room_id: &str) -> HashMap<String, PeerHandle> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sweep peers whose media session has reached the terminal closed
    /// state.
    pub async fn remove_closed(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        let Some(bucket) = rooms.get_mut(room_id) else {
            return;
        };

        let before = bucket.len();
        bucket.retain(|_, peer| peer.pc.connection_state() != RTCPeerConnectionState::Closed);

        let removed = before - bucket.len();
        if removed > 0 {
            debug!(room_id, removed, "Swept closed peers from registry");
        }

        if bucket.is_empty() {
            rooms.remove(room_id);
        }
    }
}
