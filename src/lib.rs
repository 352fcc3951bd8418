//! broadcast-relay - WebRTC broadcast relay broker
//!
//! One publisher streams media and data to the server, which relays it to
//! any number of viewers. Signaling runs over WebSockets.

pub mod broker;
pub mod config;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use broker::{Broker, BrokerError, PeerKey, Role};
pub use config::Config;
pub use webrtc::{SignalingMessage, WebRTCError};
