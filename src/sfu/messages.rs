//! Control-Channel Message Schema
//!
//! Every control-channel message is a JSON envelope
//! `{"event": <name>, "data": <string>}`. The `data` field carries either a
//! JSON-encoded payload or an SDP/ICE blob, always string-typed so the
//! envelope shape is uniform across events.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Write half of a control channel.
///
/// Messages are drained by a single writer task that owns the WebSocket
/// sink, so any task may send concurrently and each message is delivered
/// whole, in submission order.
pub type ControlSender = mpsc::Sender<SignalMessage>;

/// Control-channel event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalEvent {
    /// SDP offer from the SFU (the SFU is the only offerer).
    Offer,
    /// SDP answer from a client.
    Answer,
    /// ICE candidate, either direction.
    Candidate,
    /// Backend server registering a `(server, password, room)` triple.
    ServerRegister,
    /// Client requesting admission to a room.
    ClientJoin,
    /// Admission / registration succeeded.
    RoomJoined,
    /// Admission / registration failed.
    RoomError,
    /// Liveness ping; ignored.
    KeepAlive,
    /// Any event name this build does not recognize; ignored.
    #[serde(other)]
    Unknown,
}

/// The `{event, data}` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    pub event: SignalEvent,
    pub data: String,
}

impl SignalMessage {
    #[must_use]
    pub fn new(event: SignalEvent, data: impl Into<String>) -> Self {
        Self {
            event,
            data: data.into(),
        }
    }
}

/// Payload of `server_register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub server_id: String,
    pub server_password: String,
    pub room_id: String,
}

/// Payload of `client_join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientJoin {
    pub room_id: String,
    pub server_id: String,
    pub server_password: String,
    pub user_token: String,
}
