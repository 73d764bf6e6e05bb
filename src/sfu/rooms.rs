//! Room Registry
//!
//! Room lifecycle, server authentication, client admission, and idle
//! cleanup. Rooms are the unit of isolation: every peer, connection, and
//! track belongs to exactly one room, and a room is owned by exactly one
//! registered server.
//!
//! Locking discipline: the registry guards its tables with one
//! readers-writer lock; each room guards its inner maps with its own.
//! Acquisition order is always registry first, then room.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};
use webrtc::peer_connection::RTCPeerConnection;

use super::error::SfuError;
use super::messages::ControlSender;

/// A voice room and its current membership.
pub struct Room {
    /// Room ID, unique process-wide.
    pub id: String,
    /// Owning server; immutable for the room's lifetime.
    pub server_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Membership and activity, behind the room's own lock.
    state: RwLock<RoomState>,
}

struct RoomState {
    /// Map: clientID -> media session
    peers: HashMap<String, Arc<RTCPeerConnection>>,
    /// Map: clientID -> control channel
    connections: HashMap<String, ControlSender>,
    /// Stamped on every join, leave, and track event.
    last_activity: Instant,
}

impl Room {
    fn new(id: &str, server_id: &str) -> Self {
        Self {
            id: id.to_string(),
            server_id: server_id.to_string(),
            created_at: Utc::now(),
            state: RwLock::new(RoomState {
                peers: HashMap::new(),
                connections: HashMap::new(),
                last_activity: Instant::now(),
            }),
        }
    }

    /// Number of peers currently in the room.
    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }
}

#[derive(Default)]
struct Registry {
    /// Map: roomID -> room
    rooms: HashMap<String, Arc<Room>>,
    /// Map: serverID -> serverPassword; fixed once registered.
    servers: HashMap<String, String>,
    /// Map: serverID -> roomIDs, for cleanup accounting.
    server_rooms: HashMap<String, Vec<String>>,
}

impl Registry {
    fn create_room(&mut self, room_id: &str, server_id: &str) -> Arc<Room> {
        let room = Arc::new(Room::new(room_id, server_id));
        self.rooms.insert(room_id.to_string(), Arc::clone(&room));
        self.server_rooms
            .entry(server_id.to_string())
            .or_default()
            .push(room_id.to_string());

        info!(
            room_id,
            server_id,
            total_rooms = self.rooms.len(),
            "Created room"
        );

        room
    }
}

/// Registry of all rooms and registered servers.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Registry>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server and create its room.
    ///
    /// Idempotent for a repeated `(serverID, password, roomID)` triple.
    /// Fails when the server is known with a different password, or the
    /// room exists under a different server.
    pub async fn register_server(
        &self,
        server_id: &str,
        password: &str,
        room_id: &str,
    ) -> Result<(), SfuError> {
        let mut registry = self.inner.write().await;

        match registry.servers.entry(server_id.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get() != password {
                    return Err(SfuError::AuthMismatch(server_id.to_string()));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(password.to_string());
                debug!(server_id, "Registered server");
            }
        }

        if let Some(room) = registry.rooms.get(room_id) {
            if room.server_id != server_id {
                return Err(SfuError::RoomOwnership(room_id.to_string()));
            }
            return Ok(());
        }

        registry.create_room(room_id, server_id);
        Ok(())
    }

    /// Validate a client's join credentials.
    ///
    /// A room that does not exist yet is created lazily when the server
    /// credentials check out, so servers need not pre-register every room.
    pub async fn validate_client_join(
        &self,
        room_id: &str,
        server_id: &str,
        password: &str,
    ) -> Result<(), SfuError> {
        let mut registry = self.inner.write().await;

        let Some(registered) = registry.servers.get(server_id) else {
            return Err(SfuError::ServerUnknown(server_id.to_string()));
        };
        if registered != password {
            return Err(SfuError::AuthMismatch(server_id.to_string()));
        }

        if let Some(room) = registry.rooms.get(room_id) {
            if room.server_id != server_id {
                return Err(SfuError::RoomOwnership(room_id.to_string()));
            }
            return Ok(());
        }

        // Lazy creation: the server's credentials check out, so the room
        // appears on first join without an explicit registration.
        registry.create_room(room_id, server_id);
        Ok(())
    }

    /// Add a peer and its control channel to a room, stamping activity.
    pub async fn add_peer_to_room(
        &self,
        room_id: &str,
        client_id: &str,
        pc: Arc<RTCPeerConnection>,
        control: ControlSender,
    ) -> Result<(), SfuError> {
        let room = self.room(room_id).await?;

        let mut state = room.state.write().await;
        state.peers.insert(client_id.to_string(), pc);
        state.connections.insert(client_id.to_string(), control);
        state.last_activity = Instant::now();

        debug!(
            room_id,
            client_id,
            room_peers = state.peers.len(),
            "Added peer to room"
        );
        Ok(())
    }

    /// Remove a peer and its control channel from a room, stamping activity.
    pub async fn remove_peer_from_room(
        &self,
        room_id: &str,
        client_id: &str,
    ) -> Result<(), SfuError> {
        let room = self.room(room_id).await?;

        let mut state = room.state.write().await;
        state.peers.remove(client_id);
        state.connections.remove(client_id);
        state.last_activity = Instant::now();

        debug!(
            room_id,
            client_id,
            remaining = state.peers.len(),
            "Removed peer from room"
        );
        Ok(())
    }

    /// Stamp a room's activity clock, e.g. on track arrival.
    pub async fn touch_room(&self, room_id: &str) -> Result<(), SfuError> {
        let room = self.room(room_id).await?;
        room.state.write().await.last_activity = Instant::now();
        Ok(())
    }

    /// Shallow snapshot of a room's media sessions.
    pub async fn peers_in_room(
        &self,
        room_id: &str,
    ) -> Result<HashMap<String, Arc<RTCPeerConnection>>, SfuError> {
        let room = self.room(room_id).await?;
        let state = room.state.read().await;
        Ok(state.peers.clone())
    }

    /// Shallow snapshot of a room's control channels.
    pub async fn connections_in_room(
        &self,
        room_id: &str,
    ) -> Result<HashMap<String, ControlSender>, SfuError> {
        let room = self.room(room_id).await?;
        let state = room.state.read().await;
        Ok(state.connections.clone())
    }

    /// Total peers across all rooms; used by admission control.
    pub async fn total_peers(&self) -> usize {
        let registry = self.inner.read().await;
        let mut total = 0;
        for room in registry.rooms.values() {
            total += room.state.read().await.peers.len();
        }
        total
    }

    /// Number of rooms currently registered.
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Delete every room that is empty and has idled for at least
    /// `max_idle`, updating the server index. A server's registration is
    /// dropped along with its last room. Returns the deleted room IDs.
    pub async fn cleanup_empty_rooms(&self, max_idle: Duration) -> Vec<String> {
        let mut registry = self.inner.write().await;

        let mut doomed = Vec::new();
        for (room_id, room) in &registry.rooms {
            let state = room.state.read().await;
            if state.peers.is_empty() && state.last_activity.elapsed() >= max_idle {
                doomed.push(room_id.clone());
            }
        }

        for room_id in &doomed {
            let Some(room) = registry.rooms.remove(room_id) else {
                continue;
            };

            if let Some(rooms) = registry.server_rooms.get_mut(&room.server_id) {
                rooms.retain(|id| id != room_id);
                if rooms.is_empty() {
                    registry.server_rooms.remove(&room.server_id);
                    registry.servers.remove(&room.server_id);
                    debug!(server_id = %room.server_id, "Dropped server registration with its last room");
                }
            }

            debug!(room_id, server_id = %room.server_id, "Deleted idle room");
        }

        if !doomed.is_empty() {
            info!(
                deleted = doomed.len(),
                remaining = registry.rooms.len(),
                "Idle room cleanup complete"
            );
        }

        doomed
    }

    async fn room(&self, room_id: &str) -> Result<Arc<Room>, SfuError> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| SfuError::RoomNotFound(room_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    async fn test_pc() -> Arc<RTCPeerConnection> {
        let api = APIBuilder::new().build();
        Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("peer connection"),
        )
    }

    fn test_control() -> ControlSender {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn registration_is_idempotent_per_triple() {
        let registry = RoomRegistry::new();

        registry.register_server("s1", "p", "r1").await.unwrap();
        registry.register_server("s1", "p", "r1").await.unwrap();
        assert_eq!(registry.room_count().await, 1);

        // Same server, second room.
        registry.register_server("s1", "p", "r2").await.unwrap();
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn password_is_fixed_once_registered() {
        let registry = RoomRegistry::new();
        registry.register_server("s1", "p", "r1").await.unwrap();

        let err = registry.register_server("s1", "other", "r1").await;
        assert!(matches!(err, Err(SfuError::AuthMismatch(_))));

        let err = registry.validate_client_join("r1", "s1", "other").await;
        assert!(matches!(err, Err(SfuError::AuthMismatch(_))));
    }

    #[tokio::test]
    async fn room_ownership_is_immutable() {
        let registry = RoomRegistry::new();
        registry.register_server("s1", "p", "r1").await.unwrap();
        registry.register_server("s2", "q", "r2").await.unwrap();

        let err = registry.register_server("s2", "q", "r1").await;
        assert!(matches!(err, Err(SfuError::RoomOwnership(_))));

        let err = registry.validate_client_join("r1", "s2", "q").await;
        assert!(matches!(err, Err(SfuError::RoomOwnership(_))));
    }

    #[tokio::test]
    async fn join_requires_registered_server_but_creates_rooms_lazily() {
        let registry = RoomRegistry::new();

        let err = registry.validate_client_join("r1", "s1", "p").await;
        assert!(matches!(err, Err(SfuError::ServerUnknown(_))));

        registry.register_server("s1", "p", "r1").await.unwrap();

        // A fresh room under the same credentials is created on the fly.
        registry.validate_client_join("r9", "s1", "p").await.unwrap();
        assert_eq!(registry.room_count().await, 2);

        let peers = registry.peers_in_room("r9").await.unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn peer_membership_and_snapshots() {
        let registry = RoomRegistry::new();
        registry.register_server("s1", "p", "r1").await.unwrap();

        let err = registry
            .add_peer_to_room("missing", "c1", test_pc().await, test_control())
            .await;
        assert!(matches!(err, Err(SfuError::RoomNotFound(_))));

        registry
            .add_peer_to_room("r1", "c1", test_pc().await, test_control())
            .await
            .unwrap();
        registry
            .add_peer_to_room("r1", "c2", test_pc().await, test_control())
            .await
            .unwrap();
        assert_eq!(registry.total_peers().await, 2);

        // Snapshots are copies.
        let mut peers = registry.peers_in_room("r1").await.unwrap();
        peers.clear();
        assert_eq!(registry.peers_in_room("r1").await.unwrap().len(), 2);
        assert_eq!(registry.connections_in_room("r1").await.unwrap().len(), 2);

        registry.remove_peer_from_room("r1", "c1").await.unwrap();
        registry.remove_peer_from_room("r1", "c2").await.unwrap();
        assert_eq!(registry.total_peers().await, 0);
    }

    #[tokio::test]
    async fn cleanup_removes_only_empty_rooms() {
        let registry = RoomRegistry::new();
        registry.register_server("s1", "p", "empty").await.unwrap();
        registry.register_server("s2", "q", "busy").await.unwrap();
        registry
            .add_peer_to_room("busy", "c1", test_pc().await, test_control())
            .await
            .unwrap();

        let deleted = registry.cleanup_empty_rooms(Duration::ZERO).await;
        assert_eq!(deleted, vec!["empty".to_string()]);
        assert_eq!(registry.room_count().await, 1);

        // The empty room's server registration went with it; the busy
        // room's server is untouched.
        let err = registry.validate_client_join("empty", "s1", "p").await;
        assert!(matches!(err, Err(SfuError::ServerUnknown(_))));
        registry.validate_client_join("busy", "s2", "q").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_honors_idle_threshold() {
        let registry = RoomRegistry::new();
        registry.register_server("s1", "p", "r1").await.unwrap();

        let pc = test_pc().await;
        registry
            .add_peer_to_room("r1", "c1", Arc::clone(&pc), test_control())
            .await
            .unwrap();
        registry.remove_peer_from_room("r1", "c1").await.unwrap();
        pc.close().await.unwrap();

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        let deleted = registry.cleanup_empty_rooms(Duration::from_secs(30 * 60)).await;
        assert!(deleted.is_empty());

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        let deleted = registry.cleanup_empty_rooms(Duration::from_secs(30 * 60)).await;
        assert_eq!(deleted, vec!["r1".to_string()]);
        assert_eq!(registry.room_count().await, 0);
    }
}
