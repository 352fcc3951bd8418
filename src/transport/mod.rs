//! Signaling transport layer
//!
//! Each WebSocket connection is represented to the broker by a
//! `SignalingHandle`: a cheap, cloneable sender onto the connection's writer
//! task plus an open flag. The identity of a connection (peer id, role and
//! optional broadcast owner) comes from its upgrade query string.

pub mod protocol;
pub mod signaling_server;

pub use protocol::{ConnectionState, Flow, SignalingSession};
pub use signaling_server::{handle_generic_connection, handle_signaling_connection};

use crate::broker::Role;
use crate::webrtc::SignalingMessage;
use log::warn;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique identifier of one signaling transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(Uuid);

impl TransportId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close,
}

/// Broker-side handle to one signaling transport
#[derive(Clone)]
pub struct SignalingHandle {
    id: TransportId,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    open: Arc<AtomicBool>,
}

impl SignalingHandle {
    /// Create a handle and the receiver its writer task drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: TransportId::new(),
            tx,
            open: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    /// True until the transport is closed from either side
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Queue a message. Returns false if the transport is gone.
    pub fn send(&self, message: &SignalingMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("Failed to serialize signaling message: {}", e);
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(OutboundFrame::Text(text)).is_ok()
    }

    /// Queue a keepalive ping
    pub fn ping(&self) -> bool {
        self.is_open() && self.tx.send(OutboundFrame::Ping).is_ok()
    }

    /// Mark closed and ask the writer to close the socket. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(OutboundFrame::Close);
        }
    }
}

impl fmt::Debug for SignalingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Raw query string of a signaling upgrade request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionQuery {
    #[serde(rename = "peerId")]
    pub peer_id: Option<String>,
    #[serde(rename = "isSender")]
    pub is_sender: Option<String>,
    #[serde(rename = "broadCastOwnerId", alias = "broadcastOwnerPeerId")]
    pub broadcast_owner_id: Option<String>,
}

/// Identity of a signaling connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub peer_id: String,
    pub role: Role,
    pub broadcast_owner_id: Option<String>,
}

impl ConnectionParams {
    /// Resolve the query into an identity; `None` when `peerId` is missing
    pub fn from_query(query: ConnectionQuery) -> Option<Self> {
        let peer_id = query.peer_id.filter(|id| !id.is_empty())?;
        let is_sender = query.is_sender.as_deref() == Some("true");
        Some(Self {
            peer_id,
            role: Role::from_is_sender(is_sender),
            broadcast_owner_id: query.broadcast_owner_id.filter(|id| !id.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(peer_id: Option<&str>, is_sender: Option<&str>, owner: Option<&str>) -> ConnectionQuery {
        ConnectionQuery {
            peer_id: peer_id.map(String::from),
            is_sender: is_sender.map(String::from),
            broadcast_owner_id: owner.map(String::from),
        }
    }

    #[test]
    fn test_params_from_query() {
        let params = ConnectionParams::from_query(query(Some("B"), Some("true"), None)).unwrap();
        assert_eq!(params.role, Role::Publisher);
        assert!(params.broadcast_owner_id.is_none());

        let params = ConnectionParams::from_query(query(Some("V1"), Some("false"), Some("B"))).unwrap();
        assert_eq!(params.role, Role::Viewer);
        assert_eq!(params.broadcast_owner_id.as_deref(), Some("B"));
    }

    #[test]
    fn test_only_literal_true_means_sender() {
        let params = ConnectionParams::from_query(query(Some("A"), Some("1"), Some(""))).unwrap();
        assert_eq!(params.role, Role::Viewer);
        assert!(params.broadcast_owner_id.is_none());
    }

    #[test]
    fn test_missing_peer_id_is_rejected() {
        assert!(ConnectionParams::from_query(query(None, Some("true"), None)).is_none());
        assert!(ConnectionParams::from_query(query(Some(""), None, None)).is_none());
    }

    #[test]
    fn test_handle_send_and_close() {
        let (handle, mut rx) = SignalingHandle::channel();
        assert!(handle.send(&SignalingMessage::viewers_info(0)));
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Text(r#"{"viewersInfo":{"count":0}}"#.to_string())
        );

        handle.close();
        handle.close();
        assert!(!handle.is_open());
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Close);
        assert!(rx.try_recv().is_err());
        assert!(!handle.send(&SignalingMessage::viewers_info(1)));
    }

    #[test]
    fn test_handle_reports_dropped_writer() {
        let (handle, rx) = SignalingHandle::channel();
        drop(rx);
        assert!(!handle.is_open());
        assert!(!handle.send_text("x".to_string()));
    }
}
