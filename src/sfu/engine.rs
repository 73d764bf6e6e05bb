//! WebRTC Engine Assembly
//!
//! Builds the shared WebRTC API instance: an Opus-capable media engine, the
//! default interceptor registry, and a setting engine carrying the pinned
//! ICE UDP port range and the advertised NAT IP.

use std::sync::Arc;

use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::error::SfuError;
use crate::config::Config;

/// Build the WebRTC API shared by every peer connection.
pub fn build_api(config: &Config) -> Result<API, SfuError> {
    // Clients publish Opus audio only.
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if config.has_udp_port_range() {
        let ephemeral = EphemeralUDP::new(config.ice_udp_port_min, config.ice_udp_port_max)
            .map_err(|e| SfuError::MediaSetup(format!("invalid UDP port range: {e}")))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        info!(
            port_min = config.ice_udp_port_min,
            port_max = config.ice_udp_port_max,
            "ICE UDP port range pinned"
        );
    }
    if let Some(ip) = &config.ice_advertise_ip {
        // Rewrite host candidates for 1-to-1 NAT deployments.
        setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        info!(ip, "ICE advertise IP set");
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Create a peer connection for a joining client: one recvonly audio
/// transceiver for its published track. Subscriptions to other
/// participants arrive later as senders added by the coordinator.
pub async fn create_peer_connection(
    api: &API,
    ice_servers: Vec<RTCIceServer>,
) -> Result<Arc<RTCPeerConnection>, SfuError> {
    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })
        .await?;

    pc.add_transceiver_from_kind(
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await?;

    Ok(Arc::new(pc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_connection_starts_with_one_recvonly_audio_slot() {
        let config = Config::default_for_test();
        let api = build_api(&config).expect("api");
        let pc = create_peer_connection(&api, config.ice_servers())
            .await
            .expect("peer connection");

        let transceivers = pc.get_transceivers().await;
        assert_eq!(transceivers.len(), 1);
        assert_eq!(
            transceivers[0].direction(),
            RTCRtpTransceiverDirection::Recvonly
        );
    }

    #[test]
    fn udp_port_range_is_validated() {
        let mut config = Config::default_for_test();
        config.ice_udp_port_min = 50010;
        config.ice_udp_port_max = 50000;
        // An inverted range never reaches the setting engine.
        assert!(!config.has_udp_port_range());
    }
}
