//! Signaling protocol messages
//!
//! Every message exchanged over a signaling transport is a JSON object whose
//! shape is identified by its top-level field (`sdp`, `candidate`, `view`,
//! `broadCastReady`, ...). The shapes form a closed union; anything outside it
//! is rejected as malformed.

use super::data_channel::DataPayload;
use crate::broker::BrokerError;
use serde::{Deserialize, Serialize};

/// SDP description type, as carried in the browser's `RTCSessionDescription`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Subscribe (`leave: false`) or unsubscribe (`leave: true`) request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRequest {
    #[serde(default)]
    pub leave: bool,
    #[serde(rename = "broadcastOwnerPeerId", default)]
    pub broadcast_owner_peer_id: String,
}

/// Live viewer count sent to a publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewersInfo {
    pub count: usize,
}

/// Signaling message union
///
/// Variant order matters for parsing: a message carrying both `candidate`
/// and `sdp` is treated as a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalingMessage {
    /// ICE candidate, in either direction
    Candidate { candidate: IceCandidate },

    /// SDP offer or answer, in either direction
    Sdp { sdp: SessionDescription },

    /// View join/leave request from a viewer
    View { view: ViewRequest },

    /// Subscribe acknowledgment
    ViewReady {
        #[serde(rename = "broadCastReady")]
        ready: bool,
        #[serde(rename = "broadCastReadyMessage", default)]
        message: String,
    },

    /// The publisher a viewer was watching has gone away
    BroadcastEnded {
        #[serde(rename = "broadCastEnded")]
        ended: bool,
        #[serde(rename = "broadCastOwnerId")]
        owner_id: String,
    },

    /// Viewer count for a publisher
    ViewersInfo {
        #[serde(rename = "viewersInfo")]
        viewers_info: ViewersInfo,
    },

    /// Chat/data payload (normally carried on a data channel)
    Data(DataPayload),
}

impl SignalingMessage {
    /// Parse a signaling message from JSON
    ///
    /// On the signaling channel only chat objects (with `msg`) count as data
    /// messages; any other object is outside the union.
    pub fn from_json(json: &str) -> Result<Self, BrokerError> {
        let message: Self = serde_json::from_str(json)
            .map_err(|e| BrokerError::MalformedMessage(format!("Invalid signaling message: {}", e)))?;
        match &message {
            SignalingMessage::Data(payload) if !payload.fields.contains_key("msg") => Err(
                BrokerError::MalformedMessage("Unrecognized signaling message".to_string()),
            ),
            _ => Ok(message),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn sdp(description: SessionDescription) -> Self {
        SignalingMessage::Sdp { sdp: description }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        SignalingMessage::Candidate { candidate }
    }

    pub fn view_ready(ready: bool, message: impl Into<String>) -> Self {
        SignalingMessage::ViewReady {
            ready,
            message: message.into(),
        }
    }

    pub fn broadcast_ended(owner_id: impl Into<String>) -> Self {
        SignalingMessage::BroadcastEnded {
            ended: true,
            owner_id: owner_id.into(),
        }
    }

    pub fn viewers_info(count: usize) -> Self {
        SignalingMessage::ViewersInfo {
            viewers_info: ViewersInfo { count },
        }
    }

    /// True for messages relayed to the connection's own RTC session
    pub fn is_rtc_relay(&self) -> bool {
        matches!(self, SignalingMessage::Candidate { .. } | SignalingMessage::Sdp { .. })
    }
}
