//! Data channel payloads and the `webrtc` data channel adapter
//!
//! Payloads are arbitrary JSON objects, usually chat messages with a `msg`
//! field. When the broker relays one it stamps the originating peer into
//! `senderId`; every other field is carried through untouched.

use super::session::{DataChannel, RtcEvent};
use super::WebRTCError;
use crate::broker::BrokerError;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Data-channel message relayed between peers
///
/// Any JSON object is accepted; only `senderId` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(rename = "senderId", default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

impl DataPayload {
    /// Parse a payload received on a data channel. Non-objects are rejected.
    pub fn from_json(text: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(text)
            .map_err(|e| BrokerError::MalformedMessage(format!("Invalid data payload: {}", e)))
    }

    /// Copy of this payload with `senderId` overwritten
    pub fn stamped(&self, sender_id: &str) -> Self {
        let mut payload = self.clone();
        payload.sender_id = Some(sender_id.to_string());
        payload
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `DataChannel` backed by an `RTCDataChannel`
pub struct WebRtcDataChannel {
    label: String,
    channel: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    /// Wrap a channel opened by the remote side and forward its text messages
    /// into the session's event stream
    pub fn wire(
        channel: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<RtcEvent>,
    ) -> Arc<dyn DataChannel> {
        let label = channel.label().to_string();

        let open_label = label.clone();
        channel.on_open(Box::new(move || {
            debug!("Data channel {} opened", open_label);
            Box::pin(async {})
        }));

        let close_label = label.clone();
        channel.on_close(Box::new(move || {
            debug!("Data channel {} closed", close_label);
            Box::pin(async {})
        }));

        let message_label = label.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let label = message_label.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = events.send(RtcEvent::ChannelMessage(text));
                    }
                    Err(_) => warn!("Dropping non UTF-8 message on data channel {}", label),
                }
            })
        }));

        Arc::new(Self { label, channel })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), WebRTCError> {
        self.channel
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| WebRTCError::DataChannelError(format!("Send failed: {}", e)))
    }

    async fn close(&self) {
        let _ = self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_chat_payload() {
        let payload = DataPayload::from_json(r#"{"msg":"hi"}"#).unwrap();
        assert_eq!(payload.fields.get("msg"), Some(&json!("hi")));
        assert!(payload.sender_id.is_none());
    }

    #[test]
    fn test_stamp_overwrites_client_sender() {
        let payload = DataPayload::from_json(r#"{"msg":"hi","senderId":"spoofed"}"#).unwrap();
        assert_eq!(payload.sender_id.as_deref(), Some("spoofed"));
        let stamped = payload.stamped("B");
        assert_eq!(stamped.to_json().unwrap(), r#"{"msg":"hi","senderId":"B"}"#);
    }

    #[test]
    fn test_arbitrary_objects_are_relayed() {
        let reaction = DataPayload::from_json(r#"{"type":"reaction","emoji":"+1"}"#).unwrap();
        assert!(!reaction.fields.contains_key("msg"));
        let value: Value = serde_json::from_str(&reaction.stamped("B").to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "reaction", "emoji": "+1", "senderId": "B"}));

        let nested = DataPayload::from_json(r#"{"msg":{"text":"hi"},"color":"red"}"#).unwrap();
        let value: Value = serde_json::from_str(&nested.stamped("B").to_json().unwrap()).unwrap();
        assert_eq!(value["msg"]["text"], "hi");
        assert_eq!(value["color"], "red");
        assert_eq!(value["senderId"], "B");

        assert!(DataPayload::from_json("{}").is_ok());
    }

    #[test]
    fn test_rejects_non_object_payloads() {
        for text in ["hello", "42", r#""hi""#, "[1,2]", "null"] {
            assert!(matches!(
                DataPayload::from_json(text),
                Err(BrokerError::MalformedMessage(_))
            ));
        }
    }
}
