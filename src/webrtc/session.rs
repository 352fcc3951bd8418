//! RTC session abstraction
//!
//! The broker never touches the media engine directly. Each connection owns an
//! `RtcSession` (offer/answer, ICE ingestion, track attach, close) and receives
//! the session's asynchronous callbacks as a typed `RtcEvent` stream.

use super::media_track::MediaTrack;
use super::signaling::{IceCandidate, SessionDescription};
use super::WebRTCError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session created, awaiting offer/answer
    New,
    /// Connecting (ICE in progress)
    Connecting,
    /// Connected and relaying
    Connected,
    /// Disconnected
    Disconnected,
    /// Failed (cannot recover)
    Failed,
    /// Closed (intentionally terminated)
    Closed,
}

impl SessionState {
    /// Disconnected, failed and closed sessions are torn down by the broker
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Disconnected | SessionState::Failed | SessionState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for SessionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => SessionState::New,
            RTCPeerConnectionState::Connecting => SessionState::Connecting,
            RTCPeerConnectionState::Connected => SessionState::Connected,
            RTCPeerConnectionState::Disconnected => SessionState::Disconnected,
            RTCPeerConnectionState::Failed => SessionState::Failed,
            RTCPeerConnectionState::Closed => SessionState::Closed,
            _ => SessionState::New,
        }
    }
}

/// Media session bound to one signaling connection
#[async_trait]
pub trait RtcSession: Send + Sync {
    /// Unique session ID
    fn id(&self) -> &str;

    /// Current connection state
    fn state(&self) -> SessionState;

    /// Apply the remote offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), WebRTCError>;

    /// Create a local answer, apply it and return it
    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError>;

    /// Create a fresh local offer if the session has already been negotiated
    ///
    /// Returns `None` while no remote description is set; the next client offer
    /// will pick up any tracks added in the meantime.
    async fn renegotiate(&self) -> Result<Option<SessionDescription>, WebRTCError>;

    /// Ingest a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError>;

    /// Send a relay track to the remote side
    async fn add_track(&self, track: MediaTrack) -> Result<(), WebRTCError>;

    /// Close the session. Closing twice is not an error.
    async fn close(&self) -> Result<(), WebRTCError>;
}

/// Data channel opened by the remote side of a session
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Send a text message
    async fn send_text(&self, text: String) -> Result<(), WebRTCError>;

    /// Close the channel
    async fn close(&self);
}

/// Callbacks raised by an `RtcSession`
pub enum RtcEvent {
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),
    /// The remote side started sending a track
    Track(MediaTrack),
    /// The remote side opened a data channel
    DataChannel(Arc<dyn DataChannel>),
    /// A text message arrived on one of the session's data channels
    ChannelMessage(String),
    /// The connection state changed
    StateChange(SessionState),
}

impl std::fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtcEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            RtcEvent::Track(t) => write!(f, "Track({})", t.id()),
            RtcEvent::DataChannel(ch) => write!(f, "DataChannel({})", ch.label()),
            RtcEvent::ChannelMessage(text) => write!(f, "ChannelMessage({} bytes)", text.len()),
            RtcEvent::StateChange(state) => write!(f, "StateChange({:?})", state),
        }
    }
}

/// Creates sessions together with their event streams
#[async_trait]
pub trait RtcSessionFactory: Send + Sync {
    async fn create_session(
        &self,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>), WebRTCError>;
}
