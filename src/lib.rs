//! SFU Server
//!
//! Standalone Selective Forwarding Unit for real-time audio conferencing.
//! Backend servers register rooms over WebSocket; clients join a room,
//! publish one audio track, and receive every other participant's audio
//! forwarded packet-by-packet without mixing or transcoding.

pub mod api;
pub mod config;
pub mod sfu;
