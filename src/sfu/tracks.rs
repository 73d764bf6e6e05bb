//! Track Registry
//!
//! Per-room table of local forwarding tracks. Each publisher's remote track
//! is mirrored by a `TrackLocalStaticRTP`; the media library fans every
//! packet written to it out to all senders the coordinator has attached.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Per-room storage of forwarding tracks, keyed `(roomID, trackID)`.
#[derive(Default)]
pub struct TrackRegistry {
    /// Map: roomID -> trackID -> forwarding track
    rooms: RwLock<HashMap<String, HashMap<String, Arc<TrackLocalStaticRTP>>>>,
}

impl TrackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a forwarding track with the publisher's codec capability,
    /// track ID, and stream ID, and store it under the room. The per-room
    /// bucket is created on demand.
    pub async fn add_track_to_room(
        &self,
        room_id: &str,
        codec: RTCRtpCodecCapability,
        track_id: String,
        stream_id: String,
    ) -> Arc<TrackLocalStaticRTP> {
        let local = Arc::new(TrackLocalStaticRTP::new(codec, track_id.clone(), stream_id));

        let mut rooms = self.rooms.write().await;
        let bucket = rooms.entry(room_id.to_string()).or_default();
        bucket.insert(track_id, Arc::clone(&local));

        debug!(
            room_id,
            track_id = local.id(),
            room_tracks = bucket.len(),
            "Added forwarding track to room"
        );

        local
    }

    /// Remove a track by its ID. Idempotent if the track or room is already
    /// gone; drops the per-room bucket once it empties.
    pub async fn remove_track_from_room(&self, room_id: &str, track: &TrackLocalStaticRTP) {
        let mut rooms = self.rooms.write().await;
        let Some(bucket) = rooms.get_mut(room_id) else {
            return;
        };

        if bucket.remove(track.id()).is_some() {
            debug!(
                room_id,
                track_id = track.id(),
                remaining = bucket.len(),
                "Removed forwarding track from room"
            );
        }

        if bucket.is_empty() {
            rooms.remove(room_id);
        }
    }

    /// Shallow snapshot of a room's tracks. Callers may iterate without
    /// holding the registry lock; the internal map is never handed out.
    pub async fn tracks_in_room(&self, room_id: &str) -> HashMap<String, Arc<TrackLocalStaticRTP>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up a single track by ID.
    pub async fn track_in_room(
        &self,
        room_id: &str,
        track_id: &str,
    ) -> Option<Arc<TrackLocalStaticRTP>> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .and_then(|bucket| bucket.get(track_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;

    fn opus_codec() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_and_lookup() {
        let registry = TrackRegistry::new();
        let track = registry
            .add_track_to_room("r1", opus_codec(), "t1".into(), "s1".into())
            .await;

        assert_eq!(track.id(), "t1");
        assert!(registry.track_in_room("r1", "t1").await.is_some());
        assert!(registry.track_in_room("r1", "t2").await.is_none());
        assert!(registry.track_in_room("r2", "t1").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let registry = TrackRegistry::new();
        registry
            .add_track_to_room("r1", opus_codec(), "t1".into(), "s1".into())
            .await;

        let mut snapshot = registry.tracks_in_room("r1").await;
        snapshot.clear();

        assert_eq!(registry.tracks_in_room("r1").await.len(), 1);
    }

    #[tokio::test]
    async fn removal_is_idempotent_and_drops_empty_bucket() {
        let registry = TrackRegistry::new();
        let track = registry
            .add_track_to_room("r1", opus_codec(), "t1".into(), "s1".into())
            .await;

        registry.remove_track_from_room("r1", &track).await;
        assert!(registry.tracks_in_room("r1").await.is_empty());

        // Second removal is a no-op, as is removing from an unknown room.
        registry.remove_track_from_room("r1", &track).await;
        registry.remove_track_from_room("missing", &track).await;
    }
}
