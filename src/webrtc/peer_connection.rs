//! WebRTC PeerConnection management
//!
//! Creates `RTCPeerConnection` instances for broker connections and adapts
//! them to the `RtcSession` seam.

use super::data_channel::WebRtcDataChannel;
use super::media_track::{relay_remote_track, MediaTrack};
use super::session::{RtcEvent, RtcSession, RtcSessionFactory, SessionState};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use super::WebRTCError;
use crate::config::WebRTCConfig;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

/// PeerConnection manager for broker sessions
pub struct PeerConnectionManager {
    config: WebRTCConfig,
}

impl PeerConnectionManager {
    /// Create a new PeerConnection manager
    pub fn new(config: WebRTCConfig) -> Self {
        Self { config }
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut setting_engine = SettingEngine::default();

        if !self.config.nat1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.config.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }

        if let Some([min, max]) = self.config.ephemeral_udp_port_range {
            let ephemeral = EphemeralUDP::new(min, max)
                .map_err(|e| WebRTCError::ConnectionFailed(format!("Invalid ICE UDP port range: {}", e)))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        // Publishers pick the codec; viewers receive whatever was relayed
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = self
            .config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }

    fn keyframe_interval(&self) -> Duration {
        Duration::from_millis(self.config.keyframe_interval_ms)
    }
}

#[async_trait]
impl RtcSessionFactory for PeerConnectionManager {
    async fn create_session(
        &self,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>), WebRTCError> {
        let pc = self.create_peer_connection().await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session_id = uuid::Uuid::new_v4().to_string();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(RtcEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let tx = events_tx.clone();
        let weak_pc = Arc::downgrade(&pc);
        let keyframe_interval = self.keyframe_interval();
        pc.on_track(Box::new(
            move |remote: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let track = relay_remote_track(remote, weak_pc.clone(), keyframe_interval);
                let _ = tx.send(RtcEvent::Track(track));
                Box::pin(async {})
            },
        ));

        let tx = events_tx.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!("Remote opened data channel {}", channel.label());
                let channel = WebRtcDataChannel::wire(channel, tx.clone());
                let _ = tx.send(RtcEvent::DataChannel(channel));
            })
        }));

        let tx = events_tx;
        let state_session_id = session_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!("Session {} connection state: {}", state_session_id, state);
            let _ = tx.send(RtcEvent::StateChange(SessionState::from(state)));
            Box::pin(async {})
        }));

        let session: Arc<dyn RtcSession> = Arc::new(WebRtcSession {
            id: session_id,
            pc,
            ice_trickle: self.config.ice_trickle,
        });

        Ok((session, events_rx))
    }
}

/// `RtcSession` backed by an `RTCPeerConnection`
pub struct WebRtcSession {
    id: String,
    pc: Arc<RTCPeerConnection>,
    ice_trickle: bool,
}

impl WebRtcSession {
    /// Apply a local description, optionally waiting for ICE gathering so the
    /// returned SDP carries every candidate
    async fn apply_local(
        &self,
        sdp_type: SdpType,
        description: RTCSessionDescription,
    ) -> Result<SessionDescription, WebRTCError> {
        let mut gather_complete = self.pc.gathering_complete_promise().await;

        self.pc
            .set_local_description(description.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        if !self.ice_trickle {
            let _ = gather_complete.recv().await;
        }

        let sdp = match self.pc.local_description().await {
            Some(local) => local.sdp,
            None => description.sdp,
        };

        Ok(SessionDescription { sdp_type, sdp })
    }
}

#[async_trait]
impl RtcSession for WebRtcSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SessionState {
        SessionState::from(self.pc.connection_state())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), WebRTCError> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpType::Rollback => {
                return Err(WebRTCError::SdpError("Rollback is not supported".to_string()));
            }
        }
        .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP: {}", e)))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        self.apply_local(SdpType::Answer, answer).await
    }

    async fn renegotiate(&self) -> Result<Option<SessionDescription>, WebRTCError> {
        if self.pc.remote_description().await.is_none() {
            return Ok(None);
        }

        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.apply_local(SdpType::Offer, offer).await.map(Some)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: MediaTrack) -> Result<(), WebRTCError> {
        let sender = self
            .pc
            .add_track(track.as_track_local())
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add track {}: {}", track.id(), e)))?;

        // RTCP from the viewer must be drained for the interceptors to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.pc
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))
    }
}
