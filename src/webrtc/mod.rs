//! WebRTC side of the relay
//!
//! This module provides:
//! - The signaling message union exchanged with clients
//! - The `RtcSession` / `DataChannel` seams the broker talks to
//! - Real sessions backed by the `webrtc` crate
//! - Relay media tracks and data-channel payloads
//! - In-memory mocks for tests

pub mod data_channel;
pub mod media_track;
pub mod mock;
pub mod peer_connection;
pub mod session;
pub mod signaling;

pub use data_channel::DataPayload;
pub use media_track::MediaTrack;
pub use peer_connection::PeerConnectionManager;
pub use session::{DataChannel, RtcEvent, RtcSession, RtcSessionFactory, SessionState};
pub use signaling::SignalingMessage;

use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRTCError {
    /// Peer connection creation or teardown failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Media track error
    MediaError(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
        }
    }
}

impl Error for WebRTCError {}
