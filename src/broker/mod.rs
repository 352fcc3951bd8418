//! Broadcast broker
//!
//! `Broker` is the single owner of the peer registry and the subscription
//! graph. Every mutation happens under one `parking_lot::Mutex`; the guard is
//! never held across an `.await`. Work that needs I/O (closing RTC sessions,
//! adding tracks, sending on data channels) is snapshotted under the lock and
//! performed after it is released.

pub mod fanout;
pub mod peer;
pub mod registry;

pub use fanout::{TrackAttachment, ViewerHandle};
pub use peer::{Connection, Peer, PeerEdges, PeerKey, Role, SourceBinding, ViewerRef};
pub use registry::{ConnectionSelector, PeerRegistry};

use crate::config::BrokerConfig;
use crate::transport::{SignalingHandle, TransportId};
use crate::webrtc::{DataChannel, RtcSession, WebRTCError};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Broker errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No live publisher with this id
    PublisherNotFound(String),
    /// The requesting connection is not a registered viewer connection
    ViewerIdentityMismatch(String),
    /// Peer or connection absent
    NotFound(String),
    /// Unparseable or unrecognized payload
    MalformedMessage(String),
    /// Peer already holds the maximum number of connections
    ConnectionLimit(String),
    /// RTC session failure
    Rtc(WebRTCError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::PublisherNotFound(id) => write!(f, "Publisher with id {} not found", id),
            BrokerError::ViewerIdentityMismatch(id) => write!(f, "No viewer connection registered for {}", id),
            BrokerError::NotFound(what) => write!(f, "{} not found", what),
            BrokerError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            BrokerError::ConnectionLimit(peer) => write!(f, "Connection limit reached for {}", peer),
            BrokerError::Rtc(e) => write!(f, "{}", e),
        }
    }
}

impl Error for BrokerError {}

impl From<WebRTCError> for BrokerError {
    fn from(e: WebRTCError) -> Self {
        BrokerError::Rtc(e)
    }
}

/// Signaling-only connection outside the broadcast graph
pub struct GenericConnection {
    pub signaling: SignalingHandle,
    pub opened_at: Instant,
}

/// Per-peer entry of the `/peers` listing
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub role: Role,
    pub connections: usize,
    pub tracks: usize,
    pub data_channels: usize,
    pub viewers: usize,
    pub sources: usize,
}

/// Registry counters for the health endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub peers: usize,
    pub connections: usize,
    pub generic_connections: usize,
}

/// Broadcast broker instance
pub struct Broker {
    registry: Mutex<PeerRegistry>,
    generic: Mutex<HashMap<TransportId, GenericConnection>>,
    /// Offer again when tracks are added to a negotiated viewer session
    renegotiate: bool,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            registry: Mutex::new(PeerRegistry::new(config.max_connections_per_peer)),
            generic: Mutex::new(HashMap::new()),
            renegotiate: config.renegotiate_tracks,
        }
    }

    /// Run `f` against the registry while holding the broker lock
    pub fn with_registry<R>(&self, f: impl FnOnce(&PeerRegistry) -> R) -> R {
        f(&self.registry.lock())
    }

    /// Attach a new connection, creating its peer if needed
    pub fn attach(
        &self,
        key: &PeerKey,
        signaling: SignalingHandle,
        session: Arc<dyn RtcSession>,
    ) -> Result<(), BrokerError> {
        self.registry
            .lock()
            .attach_connection(key, Connection::new(signaling, session))
    }

    /// Detach a connection, drop every edge that referenced it and close its
    /// RTC session
    ///
    /// Publishers that lost a viewer get a fresh viewer count. Returns false
    /// if the connection was already gone.
    pub async fn detach(&self, key: &PeerKey, selector: ConnectionSelector) -> bool {
        let (connection, affected_publishers) = {
            let mut registry = self.registry.lock();
            let Some(connection) = registry.detach_connection(key, &selector) else {
                return false;
            };
            let affected = registry.purge_connection_edges(key, connection.transport_id());
            (connection, affected)
        };

        close_connection(&connection).await;

        for publisher_id in affected_publishers {
            self.notify_viewer_count(&publisher_id);
        }
        true
    }

    /// Record a data channel opened by the remote side of a connection
    pub fn record_data_channel(&self, key: &PeerKey, transport: TransportId, channel: Arc<dyn DataChannel>) -> bool {
        self.registry.lock().record_data_channel(key, transport, channel)
    }

    /// Forcibly detach every connection of a peer and remove it
    pub async fn destroy_peer(&self, key: &PeerKey) -> usize {
        let (connections, affected_publishers) = {
            let mut registry = self.registry.lock();
            let connections = registry.destroy_peer(key);
            let mut affected = Vec::new();
            for connection in &connections {
                affected.extend(registry.purge_connection_edges(key, connection.transport_id()));
            }
            (connections, affected)
        };

        for connection in &connections {
            close_connection(connection).await;
        }
        for publisher_id in dedup(affected_publishers) {
            self.notify_viewer_count(&publisher_id);
        }
        connections.len()
    }

    /// Register a signaling-only connection
    pub fn create_generic_connection(&self, signaling: SignalingHandle) {
        debug!("Generic connection {} opened", signaling.id());
        self.generic.lock().insert(
            signaling.id(),
            GenericConnection {
                signaling,
                opened_at: Instant::now(),
            },
        );
    }

    /// Remove a signaling-only connection and close its transport
    pub fn destroy_generic_connection(&self, id: TransportId) -> bool {
        match self.generic.lock().remove(&id) {
            Some(connection) => {
                connection.signaling.close();
                debug!(
                    "Generic connection {} closed after {:?}",
                    id,
                    connection.opened_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let (peers, connections) = {
            let registry = self.registry.lock();
            (registry.peer_count(), registry.connection_count())
        };
        BrokerStats {
            peers,
            connections,
            generic_connections: self.generic.lock().len(),
        }
    }

    /// Per-peer summary, sorted by id then role
    pub fn snapshot(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.with_registry(|registry| {
            registry
                .peers()
                .map(|peer| PeerSummary {
                    id: peer.id().to_string(),
                    role: peer.role(),
                    connections: peer.connections.len(),
                    tracks: peer.connections.iter().map(|c| c.tracks.len()).sum(),
                    data_channels: peer.connections.iter().map(|c| c.channels.len()).sum(),
                    viewers: peer.viewers().len(),
                    sources: peer.sources().len(),
                })
                .collect()
        });
        peers.sort_by(|a, b| a.id.cmp(&b.id).then(a.role.as_str().cmp(b.role.as_str())));
        peers
    }

    /// Detach every connection and every generic connection
    pub async fn shutdown(&self) {
        let connections = self.registry.lock().drain();
        let generic: Vec<GenericConnection> = self.generic.lock().drain().map(|(_, c)| c).collect();

        info!(
            "Broker shutting down: closing {} connections and {} generic connections",
            connections.len(),
            generic.len()
        );

        for connection in &generic {
            connection.signaling.close();
        }
        for connection in &connections {
            close_connection(connection).await;
        }
    }
}

async fn close_connection(connection: &Connection) {
    connection.signaling.close();
    if let Err(e) = connection.session.close().await {
        debug!("Closing session {}: {}", connection.session.id(), e);
    }
}

fn dedup(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OutboundFrame;
    use crate::webrtc::mock::MockRtcSession;

    fn broker() -> Broker {
        Broker::new(&BrokerConfig::default())
    }

    #[test]
    fn test_publisher_not_found_message() {
        assert_eq!(
            BrokerError::PublisherNotFound("Z".to_string()).to_string(),
            "Publisher with id Z not found"
        );
    }

    #[tokio::test]
    async fn test_detach_closes_transport_and_session() {
        let broker = broker();
        let key = PeerKey::publisher("B");
        let (signaling, mut rx) = SignalingHandle::channel();
        let transport = signaling.id();
        let session = MockRtcSession::new("s1");
        broker.attach(&key, signaling, session.clone()).unwrap();
        assert_eq!(broker.stats().connections, 1);

        assert!(broker.detach(&key, ConnectionSelector::Transport(transport)).await);
        assert!(session.is_closed());
        assert_eq!(rx.recv().await, Some(OutboundFrame::Close));
        assert_eq!(broker.stats(), BrokerStats::default());

        assert!(!broker.detach(&key, ConnectionSelector::Transport(transport)).await);
        assert_eq!(session.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_generic_connections_are_outside_the_graph() {
        let broker = broker();
        let (signaling, _rx) = SignalingHandle::channel();
        let id = signaling.id();
        broker.create_generic_connection(signaling);
        assert_eq!(broker.stats().generic_connections, 1);
        assert_eq!(broker.stats().peers, 0);
        assert!(broker.destroy_generic_connection(id));
        assert!(!broker.destroy_generic_connection(id));
    }

    #[tokio::test]
    async fn test_snapshot_and_shutdown() {
        let broker = broker();
        let (s1, _rx1) = SignalingHandle::channel();
        let (s2, _rx2) = SignalingHandle::channel();
        let (s3, _rx3) = SignalingHandle::channel();
        let publisher_session = MockRtcSession::new("p");
        broker.attach(&PeerKey::publisher("B"), s1, publisher_session.clone()).unwrap();
        broker.attach(&PeerKey::viewer("B"), s2, MockRtcSession::new("v")).unwrap();
        broker.create_generic_connection(s3);

        let peers = broker.snapshot();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].role, Role::Publisher);
        assert_eq!(peers[1].role, Role::Viewer);

        broker.shutdown().await;
        assert_eq!(broker.stats(), BrokerStats::default());
        assert!(publisher_session.is_closed());
    }
}
