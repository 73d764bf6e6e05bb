//! Signaling Coordinator
//!
//! Converges every peer's outbound sender set to its room's current track
//! set and drives renegotiation. `signal_room` is idempotent and safe to
//! invoke on every join, leave, and track event; the guarantee is
//! convergence after events quiesce, not instantaneous consistency.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::error::SfuError;
use super::messages::{ControlSender, SignalEvent, SignalMessage};
use super::peers::PeerRegistry;
use super::rooms::RoomRegistry;
use super::tracks::TrackRegistry;

/// Backoff schedule absorbing transient states, e.g. a peer finishing its
/// answer between attempts.
const SYNC_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_millis(500),
];

/// Reconciles room membership with each member's negotiated tracks.
pub struct Coordinator {
    rooms: Arc<RoomRegistry>,
    peers: Arc<PeerRegistry>,
    tracks: Arc<TrackRegistry>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        rooms: Arc<RoomRegistry>,
        peers: Arc<PeerRegistry>,
        tracks: Arc<TrackRegistry>,
    ) -> Self {
        Self {
            rooms,
            peers,
            tracks,
        }
    }

    /// Reconcile every peer in a room so that its sender set equals the
    /// room's track set minus the peer's own tracks, issuing offers where
    /// needed. Per-peer failures are isolated and the whole room is retried
    /// on a bounded backoff schedule; a room deleted mid-flight ends the
    /// trigger quietly.
    pub async fn signal_room(&self, room_id: &str) {
        self.peers.remove_closed(room_id).await;

        let Ok(peers) = self.rooms.peers_in_room(room_id).await else {
            debug!(room_id, "Room gone before signaling");
            return;
        };
        let Ok(connections) = self.rooms.connections_in_room(room_id).await else {
            debug!(room_id, "Room gone before signaling");
            return;
        };
        if peers.is_empty() {
            return;
        }

        for (attempt, backoff) in SYNC_BACKOFF.iter().enumerate() {
            let failed = self.sync_attempt(room_id, &peers, &connections).await;
            if failed == 0 {
                debug!(room_id, attempts = attempt + 1, "Room signaling converged");
                return;
            }
            if attempt + 1 == SYNC_BACKOFF.len() {
                warn!(
                    room_id,
                    failed, "Giving up on room signaling for this trigger"
                );
                return;
            }
            tokio::time::sleep(*backoff).await;
        }
    }

    /// A publisher's track appeared in a room.
    pub async fn on_track_added(&self, room_id: &str) {
        let _ = self.rooms.touch_room(room_id).await;
        self.signal_room(room_id).await;
    }

    /// A publisher's track left a room.
    pub async fn on_track_removed(&self, room_id: &str) {
        let _ = self.rooms.touch_room(room_id).await;
        self.signal_room(room_id).await;
    }

    /// One pass over the room's peers. Returns the number of peers that
    /// failed to reconcile.
    async fn sync_attempt(
        &self,
        room_id: &str,
        peers: &HashMap<String, Arc<RTCPeerConnection>>,
        connections: &HashMap<String, ControlSender>,
    ) -> usize {
        let tracks = self.tracks.tracks_in_room(room_id).await;
        let mut failed = 0;

        for (client_id, pc) in peers {
            let connection_state = pc.connection_state();
            if matches!(
                connection_state,
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
            ) {
                debug!(client_id, state = %connection_state, "Skipping terminal peer");
                continue;
            }

            let Some(control) = connections.get(client_id) else {
                debug!(client_id, "No control channel for peer");
                failed += 1;
                continue;
            };

            match reconcile_peer(client_id, pc, control, &tracks).await {
                Ok(true) => debug!(client_id, room_id, "Offer sent"),
                Ok(false) => {}
                Err(err) => {
                    debug!(client_id, room_id, error = %err, "Peer reconciliation failed");
                    failed += 1;
                }
            }
        }

        failed
    }
}

/// Reconcile a single peer against the room's track set. Returns whether an
/// offer was sent.
async fn reconcile_peer(
    client_id: &str,
    pc: &Arc<RTCPeerConnection>,
    control: &ControlSender,
    room_tracks: &HashMap<String, Arc<TrackLocalStaticRTP>>,
) -> Result<bool, SfuError> {
    // A peer with an unanswered local offer must be left alone entirely:
    // a track added now would be consumed into a transceiver that never
    // appears in an offer. The post-answer re-signal picks it up instead.
    let signaling_state = pc.signaling_state();
    if signaling_state != RTCSignalingState::Stable {
        debug!(client_id, state = %signaling_state, "Skipping peer, signaling not stable");
        return Ok(false);
    }

    // Track IDs this peer already handles: its current senders, plus its
    // receivers so a client never gets its own published track echoed back.
    let mut handled: HashSet<String> = HashSet::new();
    let mut removed = 0;

    for sender in pc.get_senders().await {
        let Some(track) = sender.track().await else {
            continue;
        };
        let track_id = track.id().to_string();

        if !room_tracks.contains_key(&track_id) {
            pc.remove_track(&sender).await?;
            removed += 1;
            continue;
        }
        handled.insert(track_id);
    }

    for receiver in pc.get_receivers().await {
        let Some(track) = receiver.tracks().await.into_iter().next() else {
            continue;
        };
        handled.insert(track.id());
    }

    let mut added = 0;
    for (track_id, local_track) in room_tracks {
        if handled.contains(track_id) {
            continue;
        }
        pc.add_track(Arc::clone(local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        added += 1;
    }

    // A fresh connection always gets an offer so the transport establishes
    // and the client's publish direction can flow, even into an empty room.
    // Established connections renegotiate only on actual sender changes.
    let is_new = pc.connection_state() == RTCPeerConnectionState::New;
    if added == 0 && removed == 0 && !is_new {
        return Ok(false);
    }

    debug!(client_id, added, removed, is_new, "Creating offer");
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;

    let payload = serde_json::to_string(&offer)?;
    control
        .send(SignalMessage::new(SignalEvent::Offer, payload))
        .await
        .map_err(|_| SfuError::TransportClosed)?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sfu::engine;
    use tokio::sync::mpsc;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::api::API;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    struct Fixture {
        rooms: Arc<RoomRegistry>,
        peers: Arc<PeerRegistry>,
        tracks: Arc<TrackRegistry>,
        coordinator: Coordinator,
        api: API,
    }

    async fn fixture() -> Fixture {
        let rooms = Arc::new(RoomRegistry::new());
        let peers = Arc::new(PeerRegistry::new());
        let tracks = Arc::new(TrackRegistry::new());
        let coordinator = Coordinator::new(
            Arc::clone(&rooms),
            Arc::clone(&peers),
            Arc::clone(&tracks),
        );
        let api = engine::build_api(&Config::default_for_test()).expect("api");

        let fixture = Fixture {
            rooms,
            peers,
            tracks,
            coordinator,
            api,
        };
        fixture
            .rooms
            .register_server("s1", "p", "r1")
            .await
            .expect("register");
        fixture
    }

    async fn join_peer(
        fixture: &Fixture,
        client_id: &str,
    ) -> (Arc<RTCPeerConnection>, mpsc::Receiver<SignalMessage>) {
        let pc = engine::create_peer_connection(&fixture.api, vec![])
            .await
            .expect("peer connection");
        let (tx, rx) = mpsc::channel(16);
        fixture
            .rooms
            .add_peer_to_room("r1", client_id, Arc::clone(&pc), tx.clone())
            .await
            .expect("add peer");
        fixture.peers.add("r1", client_id, Arc::clone(&pc), tx).await;
        (pc, rx)
    }

    fn opus_codec() -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        }
    }

    /// Feed the peer's outstanding offer through a scratch answerer and
    /// apply the answer, returning the peer to the stable state.
    async fn answer_outstanding_offer(api: &API, pc: &Arc<RTCPeerConnection>) {
        let offer = pc.local_description().await.expect("local offer");
        let answerer = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .expect("answerer");
        answerer
            .set_remote_description(offer)
            .await
            .expect("set remote offer");
        let answer = answerer.create_answer(None).await.expect("answer");
        answerer
            .set_local_description(answer.clone())
            .await
            .expect("answerer local");
        pc.set_remote_description(answer).await.expect("set answer");
        answerer.close().await.expect("close answerer");
    }

    async fn active_sender_count(pc: &Arc<RTCPeerConnection>) -> usize {
        let mut count = 0;
        for sender in pc.get_senders().await {
            if sender.track().await.is_some() {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn new_peer_receives_initial_offer_even_in_empty_room() {
        let fixture = fixture().await;
        let (pc, mut rx) = join_peer(&fixture, "c1").await;

        fixture.coordinator.signal_room("r1").await;

        let message = rx.recv().await.expect("offer");
        assert_eq!(message.event, SignalEvent::Offer);
        let offer: RTCSessionDescription = serde_json::from_str(&message.data).expect("offer sdp");
        assert!(!offer.sdp.is_empty());
        assert_eq!(pc.signaling_state(), RTCSignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn peer_with_outstanding_offer_is_left_alone() {
        let fixture = fixture().await;
        let (pc, mut rx) = join_peer(&fixture, "c1").await;

        fixture.coordinator.signal_room("r1").await;
        rx.recv().await.expect("initial offer");

        // A track arriving while the offer is unanswered must not be
        // consumed into a non-advertised transceiver.
        fixture
            .tracks
            .add_track_to_room("r1", opus_codec(), "t-beta".into(), "s-beta".into())
            .await;
        fixture.coordinator.signal_room("r1").await;

        assert!(rx.try_recv().is_err());
        assert_eq!(active_sender_count(&pc).await, 0);
    }

    #[tokio::test]
    async fn sender_set_follows_room_tracks() {
        let fixture = fixture().await;
        let (pc, mut rx) = join_peer(&fixture, "c1").await;

        let beta = fixture
            .tracks
            .add_track_to_room("r1", opus_codec(), "t-beta".into(), "s-beta".into())
            .await;
        fixture.coordinator.signal_room("r1").await;
        assert_eq!(rx.recv().await.expect("offer").event, SignalEvent::Offer);
        assert_eq!(active_sender_count(&pc).await, 1);

        // Re-signaling with an unanswered offer changes nothing.
        fixture.coordinator.signal_room("r1").await;
        assert_eq!(active_sender_count(&pc).await, 1);

        // Once answered, a second track becomes a second sender without
        // duplicating the first.
        answer_outstanding_offer(&fixture.api, &pc).await;
        fixture
            .tracks
            .add_track_to_room("r1", opus_codec(), "t-gamma".into(), "s-gamma".into())
            .await;
        fixture.coordinator.signal_room("r1").await;
        assert_eq!(active_sender_count(&pc).await, 2);

        // Track removal drops the matching sender on the next pass.
        answer_outstanding_offer(&fixture.api, &pc).await;
        fixture.tracks.remove_track_from_room("r1", &beta).await;
        fixture.coordinator.signal_room("r1").await;
        assert_eq!(active_sender_count(&pc).await, 1);
    }

    #[tokio::test]
    async fn vanished_room_ends_the_trigger_quietly() {
        let fixture = fixture().await;
        fixture.coordinator.signal_room("no-such-room").await;
    }
}
