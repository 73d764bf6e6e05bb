//! Session Handling
//!
//! One task per control channel. Server-mode sessions register rooms;
//! client-mode sessions are admitted into a room, get a WebRTC peer
//! connection wired up, and pump candidate/answer messages until the
//! channel closes. Each session is its own failure boundary: an error
//! unwinds the session, never the process.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::engine;
use super::error::SfuError;
use super::messages::{ClientJoin, ControlSender, ServerRegistration, SignalEvent, SignalMessage};
use crate::api::AppState;

/// RTP read buffer, sized for a standard MTU.
const RTP_MTU: usize = 1500;

/// How long a finished session waits for queued control messages (e.g. a
/// final `room_error`) to flush before the writer is torn down.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Connection-unique client ID: 16 random bytes, hex-encoded.
fn generate_client_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Writer task owning the WebSocket sink. All control-channel writes are
/// funneled through its channel, which serializes them and keeps each
/// message atomic.
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<SignalMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    error!(error = %err, "Failed to serialize control message");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    })
}

/// Read the next parseable control message. Malformed frames are discarded;
/// `None` means the channel closed or errored.
async fn next_message(receiver: &mut SplitStream<WebSocket>) -> Option<SignalMessage> {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalMessage>(text.as_str()) {
                Ok(message) => return Some(message),
                Err(err) => {
                    warn!(error = %err, "Discarding malformed control message");
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {} // ping/pong/binary
            Err(err) => {
                debug!(error = %err, "Control channel read failed");
                return None;
            }
        }
    }
    None
}

async fn send(
    control: &ControlSender,
    event: SignalEvent,
    data: impl Into<String>,
) -> Result<(), SfuError> {
    control
        .send(SignalMessage::new(event, data))
        .await
        .map_err(|_| SfuError::TransportClosed)
}

/// Server-mode session: backend servers registering rooms.
pub async fn run_server_session(socket: WebSocket, state: AppState) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(32);
    let writer = spawn_writer(sink, rx);

    let client_id = generate_client_id();
    debug!(client_id, "Server control channel established");

    while let Some(message) = next_message(&mut receiver).await {
        match message.event {
            SignalEvent::ServerRegister => {
                if let Err(err) =
                    handle_server_registration(&state, &tx, &client_id, &message.data).await
                {
                    debug!(client_id, error = %err, "Server registration failed");
                }
            }
            SignalEvent::KeepAlive => {}
            other => {
                debug!(client_id, event = ?other, "Ignoring unexpected server event");
            }
        }
    }

    debug!(client_id, "Server control channel closed");
    drop(tx);
    let _ = writer.await;
}

async fn handle_server_registration(
    state: &AppState,
    control: &ControlSender,
    client_id: &str,
    data: &str,
) -> Result<(), SfuError> {
    let registration: ServerRegistration = match serde_json::from_str(data) {
        Ok(registration) => registration,
        Err(err) => {
            send(control, SignalEvent::RoomError, "Invalid registration data").await?;
            return Err(err.into());
        }
    };

    info!(
        client_id,
        server_id = %registration.server_id,
        room_id = %registration.room_id,
        "Server registration attempt"
    );

    match state
        .rooms
        .register_server(
            &registration.server_id,
            &registration.server_password,
            &registration.room_id,
        )
        .await
    {
        Ok(()) => {
            send(
                control,
                SignalEvent::RoomJoined,
                "Server registered successfully",
            )
            .await?;
            Ok(())
        }
        Err(err) => {
            send(
                control,
                SignalEvent::RoomError,
                format!("Registration failed: {err}"),
            )
            .await?;
            Err(err)
        }
    }
}

/// Client-mode session: admission, peer wiring, then the message pump.
pub async fn run_client_session(socket: WebSocket, state: AppState) {
    let (sink, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel(64);
    let mut writer = spawn_writer(sink, rx);

    let client_id = generate_client_id();
    debug!(client_id, "Client control channel established");

    match client_session(&state, &mut receiver, tx, &client_id).await {
        Ok(()) => debug!(client_id, "Client session closed"),
        Err(err) => debug!(client_id, error = %err, "Client session ended"),
    }

    // Let queued messages (e.g. a final room_error) flush. Callbacks on a
    // not-yet-dropped peer connection may still hold channel clones, so
    // don't wait on them forever.
    let _ = tokio::time::timeout(WRITER_DRAIN, &mut writer).await;
    writer.abort();
}

async fn client_session(
    state: &AppState,
    receiver: &mut SplitStream<WebSocket>,
    control: ControlSender,
    client_id: &str,
) -> Result<(), SfuError> {
    // The first message must be a join request.
    let Some(first) = next_message(receiver).await else {
        return Err(SfuError::TransportClosed);
    };
    if first.event != SignalEvent::ClientJoin {
        let _ = send(&control, SignalEvent::RoomError, "Expected client_join event").await;
        return Err(SfuError::InvalidPayload(format!(
            "expected client_join, got {:?}",
            first.event
        )));
    }
    let join: ClientJoin = match serde_json::from_str(&first.data) {
        Ok(join) => join,
        Err(err) => {
            let _ = send(&control, SignalEvent::RoomError, "Invalid join data").await;
            return Err(err.into());
        }
    };

    let room_id = join.room_id.clone();
    info!(
        client_id,
        room_id,
        server_id = %join.server_id,
        "Client requesting room admission"
    );

    if let Err(err) = state
        .rooms
        .validate_client_join(&room_id, &join.server_id, &join.server_password)
        .await
    {
        let _ = send(
            &control,
            SignalEvent::RoomError,
            format!("Join validation failed: {err}"),
        )
        .await;
        return Err(err);
    }

    // Admission control: bound concurrent sessions to what the pinned ICE
    // UDP port range can bind.
    if state.config.max_peers > 0 {
        let current = state.rooms.total_peers().await;
        if current >= state.config.max_peers {
            let max = state.config.max_peers;
            let _ = send(
                &control,
                SignalEvent::RoomError,
                format!(
                    "Sorry, there are no seats left in this voice server ({current}/{max}). Try again later."
                ),
            )
            .await;
            return Err(SfuError::CapacityExceeded { current, max });
        }
    }

    let pc = match engine::create_peer_connection(&state.webrtc_api, state.config.ice_servers())
        .await
    {
        Ok(pc) => pc,
        Err(err) => {
            let _ = send(
                &control,
                SignalEvent::RoomError,
                "Failed to create peer connection",
            )
            .await;
            return Err(err);
        }
    };

    wire_peer_callbacks(state, &pc, &control, client_id, &room_id);

    if let Err(err) = state
        .rooms
        .add_peer_to_room(&room_id, client_id, Arc::clone(&pc), control.clone())
        .await
    {
        let _ = send(&control, SignalEvent::RoomError, "Failed to join room").await;
        let _ = pc.close().await;
        return Err(err);
    }
    state
        .peers
        .add(&room_id, client_id, Arc::clone(&pc), control.clone())
        .await;

    // From here on the peer is registered, so every exit must run the
    // cleanup below.
    let result = async {
        send(&control, SignalEvent::RoomJoined, "Successfully joined room").await?;
        info!(client_id, room_id, "Client joined room");

        // Admit the new peer into the room's current track set and send it
        // the initial offer. Required even for an empty room so the
        // transport establishes and the client's publish direction can flow.
        state.coordinator.signal_room(&room_id).await;

        pump_client_messages(state, receiver, &pc, client_id, &room_id).await
    }
    .await;

    info!(client_id, room_id, "Client leaving room");
    if let Err(err) = pc.close().await {
        warn!(client_id, error = %err, "Error closing peer connection");
    }
    if let Err(err) = state.rooms.remove_peer_from_room(&room_id, client_id).await {
        debug!(client_id, error = %err, "Room already gone during cleanup");
    }
    state.peers.remove(&room_id, client_id).await;
    state.coordinator.signal_room(&room_id).await;

    result
}

/// Candidate/answer/keep-alive pump. Per-message errors are logged, not
/// fatal; the loop ends when the channel closes.
async fn pump_client_messages(
    state: &AppState,
    receiver: &mut SplitStream<WebSocket>,
    pc: &Arc<RTCPeerConnection>,
    client_id: &str,
    room_id: &str,
) -> Result<(), SfuError> {
    while let Some(message) = next_message(receiver).await {
        let outcome = match message.event {
            SignalEvent::Candidate => handle_candidate(pc, &message.data).await,
            SignalEvent::Answer => handle_answer(state, pc, room_id, &message.data).await,
            SignalEvent::KeepAlive => Ok(()),
            other => {
                debug!(client_id, event = ?other, "Ignoring unexpected client event");
                Ok(())
            }
        };
        if let Err(err) = outcome {
            debug!(client_id, room_id, error = %err, "Error processing client message");
        }
    }
    Ok(())
}

async fn handle_candidate(pc: &Arc<RTCPeerConnection>, data: &str) -> Result<(), SfuError> {
    let candidate: RTCIceCandidateInit = serde_json::from_str(data)?;
    pc.add_ice_candidate(candidate).await?;
    Ok(())
}

async fn handle_answer(
    state: &AppState,
    pc: &Arc<RTCPeerConnection>,
    room_id: &str,
    data: &str,
) -> Result<(), SfuError> {
    let answer: RTCSessionDescription = serde_json::from_str(data)?;
    pc.set_remote_description(answer).await?;

    // Signaling is stable again. Re-signal asynchronously so tracks that
    // arrived while this peer had an outstanding offer get drained without
    // holding up the read loop. The "no changes, no offer" rule in the
    // coordinator keeps this from ping-ponging.
    let coordinator = Arc::clone(&state.coordinator);
    let room_id = room_id.to_string();
    tokio::spawn(async move {
        coordinator.signal_room(&room_id).await;
    });

    Ok(())
}

/// Wire the media-plane callbacks for a freshly admitted peer.
fn wire_peer_callbacks(
    state: &AppState,
    pc: &Arc<RTCPeerConnection>,
    control: &ControlSender,
    client_id: &str,
    room_id: &str,
) {
    // Local ICE candidates go to the client. The nil sentinel marking
    // end-of-gathering is observed but not forwarded.
    {
        let control = control.clone();
        let client_id = client_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let control = control.clone();
            let client_id = client_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        warn!(client_id, error = %err, "Failed to convert ICE candidate");
                        return;
                    }
                };
                match serde_json::to_string(&init) {
                    Ok(payload) => {
                        if send(&control, SignalEvent::Candidate, payload).await.is_err() {
                            debug!(client_id, "Control channel closed while sending candidate");
                        }
                    }
                    Err(err) => warn!(client_id, error = %err, "Failed to serialize ICE candidate"),
                }
            })
        }));
    }

    // Terminal states: `failed` closes the session; `closed` sweeps the
    // media-plane registry and refreshes the other peers' sender sets.
    {
        let weak_pc = Arc::downgrade(pc);
        let coordinator = Arc::clone(&state.coordinator);
        let peers = Arc::clone(&state.peers);
        let client_id = client_id.to_string();
        let room_id = room_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |connection_state| {
            let weak_pc = weak_pc.clone();
            let coordinator = Arc::clone(&coordinator);
            let peers = Arc::clone(&peers);
            let client_id = client_id.clone();
            let room_id = room_id.clone();
            Box::pin(async move {
                debug!(client_id, state = %connection_state, "Peer connection state changed");
                match connection_state {
                    RTCPeerConnectionState::Failed => {
                        if let Some(pc) = weak_pc.upgrade() {
                            if let Err(err) = pc.close().await {
                                warn!(client_id, error = %err, "Failed to close failed peer");
                            }
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        peers.remove_closed(&room_id).await;
                        coordinator.signal_room(&room_id).await;
                    }
                    RTCPeerConnectionState::Connected => {
                        info!(client_id, room_id, "Peer connection established");
                    }
                    _ => {}
                }
            })
        }));
    }

    // The publisher's audio track: mirror it into the track registry, let
    // the coordinator fan it out, and forward RTP until the read loop ends.
    {
        let tracks = Arc::clone(&state.tracks);
        let coordinator = Arc::clone(&state.coordinator);
        let verbose_log = state.config.verbose_log;
        let client_id = client_id.to_string();
        let room_id = room_id.to_string();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tracks = Arc::clone(&tracks);
            let coordinator = Arc::clone(&coordinator);
            let client_id = client_id.clone();
            let room_id = room_id.clone();
            Box::pin(async move {
                info!(
                    client_id,
                    room_id,
                    track_id = %track.id(),
                    ssrc = track.ssrc(),
                    "Remote track received"
                );

                let local = tracks
                    .add_track_to_room(
                        &room_id,
                        track.codec().capability,
                        track.id(),
                        track.stream_id(),
                    )
                    .await;
                coordinator.on_track_added(&room_id).await;

                tokio::spawn(async move {
                    forward_rtp(&track, &local, &client_id, verbose_log).await;

                    tracks.remove_track_from_room(&room_id, &local).await;
                    coordinator.on_track_removed(&room_id).await;
                });
            })
        }));
    }
}

/// Copy RTP from a publisher's remote track onto its forwarding track until
/// the read loop ends. The media library fans each packet written to the
/// local track out to every attached sender.
async fn forward_rtp(
    remote: &TrackRemote,
    local: &TrackLocalStaticRTP,
    client_id: &str,
    verbose_log: bool,
) {
    let mut buf = vec![0u8; RTP_MTU];
    let mut forwarded: u64 = 0;

    loop {
        let (packet, _) = match remote.read(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                debug!(client_id, error = %err, forwarded, "Track read ended");
                return;
            }
        };

        if let Err(err) = local.write_rtp(&packet).await {
            debug!(client_id, error = %err, forwarded, "Track write ended");
            return;
        }

        forwarded += 1;
        if verbose_log && forwarded % 1000 == 0 {
            debug!(client_id, forwarded, "RTP packets forwarded");
        }
    }
}
