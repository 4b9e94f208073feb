//! Peer Connection Abstraktion
//!
//! Die NegotiationEngine spricht nur mit dem `PeerConnection` Trait.
//! `WebRtcPeerFactory` liefert die echte Implementierung auf Basis von
//! webrtc-rs.

use super::negotiation::{ConnectionState, NegotiationError};
use crate::config::IceServerConfig;
use crate::media::{LocalTrack, TrackKind, SAMPLE_RATE};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// PEER EVENTS
// ============================================================================

/// Beobachtete Ereignisse der Peer Connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Neuer lokaler ICE Candidate
    LocalCandidate(IceCandidate),

    /// Connection-State hat sich geändert
    StateChanged(ConnectionState),

    /// Remote Media ist angekommen
    RemoteTrack { kind: TrackKind },
}

// ============================================================================
// TRAITS
// ============================================================================

/// Handle auf eine Peer Connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Erstellt Peer Connections, deren Events in `events` landen
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// PeerFactory auf Basis von webrtc-rs
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = WebRtcPeer::connect(ice_servers, events).await?;
        Ok(Arc::new(peer))
    }
}

/// Peer Connection über webrtc-rs
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    /// Erstellt eine neue Peer Connection
    pub async fn connect(
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, NegotiationError> {
        // Media Engine mit Default-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        Self::register_handlers(&pc, events);

        Ok(Self { pc })
    }

    /// Registriert Event Handler für die Peer Connection
    fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
        // Connection State Handler
        let event_tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            let _ = event_tx.send(PeerEvent::StateChanged(ConnectionState::from(s)));
            Box::pin(async {})
        }));

        // ICE Candidate Handler
        let event_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = event_tx.send(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Media)
        let event_tx = events;
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Received remote track: {:?}", track.codec());
            let _ = event_tx.send(PeerEvent::RemoteTrack { kind });
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_local_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        let rtp_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            track.id().to_string(),
            "call-session".to_string(),
        ));

        self.pc
            .add_track(rtp_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(description)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(webrtc_err)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc_description(description)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(webrtc_err)
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn webrtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::WebRTC(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Closed),
            ConnectionState::Closed
        );
    }

    #[test]
    fn test_ice_server_credentials() {
        let server = to_rtc_ice_server(&IceServerConfig::turn("turn:t.example.com", "u", "p"));
        assert_eq!(server.urls, vec!["turn:t.example.com".to_string()]);
        assert_eq!(server.username, "u");
        assert_eq!(server.credential, "p");

        let stun = to_rtc_ice_server(&IceServerConfig::stun("stun:s.example.com"));
        assert!(stun.username.is_empty());
    }

    #[test]
    fn test_invalid_sdp_is_rejected() {
        let result = to_rtc_description(SessionDescription::offer("not an sdp"));
        assert!(matches!(result, Err(NegotiationError::InvalidSdp(_))));
    }

    #[tokio::test]
    async fn test_webrtc_peer_creates_offer_with_audio() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = WebRtcPeer::connect(&[], tx).await.unwrap();

        let track = crate::testing::fake_track(TrackKind::Audio);
        peer.add_local_track(&track).await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        peer.close().await.unwrap();
    }
}
