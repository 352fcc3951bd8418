//! Peer registry
//!
//! Owns every live `Peer` and its `Connection`s. The registry itself is plain
//! synchronous state; `Broker` serializes access to it. A peer exists exactly
//! as long as it has at least one connection.

use super::peer::{Connection, Peer, PeerKey, Role};
use super::BrokerError;
use crate::transport::TransportId;
use crate::webrtc::{DataChannel, MediaTrack};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// Selects the connection to detach
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSelector {
    Transport(TransportId),
    Session(String),
    Both(TransportId, String),
}

impl ConnectionSelector {
    fn matches(&self, connection: &Connection) -> bool {
        match self {
            ConnectionSelector::Transport(id) => connection.transport_id() == *id,
            ConnectionSelector::Session(id) => connection.session.id() == id,
            ConnectionSelector::Both(transport, session) => {
                connection.transport_id() == *transport && connection.session.id() == session
            }
        }
    }
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerKey, Peer>,
    /// 0 means unlimited
    max_connections_per_peer: usize,
}

impl PeerRegistry {
    pub fn new(max_connections_per_peer: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_connections_per_peer,
        }
    }

    /// Look up a peer. Without a role, a publisher is preferred over a viewer.
    pub fn get_peer(&self, id: &str, role: Option<Role>) -> Option<&Peer> {
        match role {
            Some(role) => self.peers.get(&PeerKey::new(id, role)),
            None => self
                .peers
                .get(&PeerKey::publisher(id))
                .or_else(|| self.peers.get(&PeerKey::viewer(id))),
        }
    }

    pub fn peer(&self, key: &PeerKey) -> Option<&Peer> {
        self.peers.get(key)
    }

    pub fn peer_mut(&mut self, key: &PeerKey) -> Option<&mut Peer> {
        self.peers.get_mut(key)
    }

    /// Return the peer for `key`, creating an empty one if needed
    ///
    /// The caller must attach a connection before releasing the registry.
    pub fn get_or_create_peer(&mut self, key: PeerKey) -> &mut Peer {
        self.peers.entry(key).or_insert_with_key(|key| {
            info!("Peer {} created", key);
            Peer::new(key.clone())
        })
    }

    /// Attach a connection, creating the peer if it does not exist yet
    ///
    /// A new publisher connection is bound to every viewer connection that
    /// already watches that publisher.
    pub fn attach_connection(&mut self, key: &PeerKey, connection: Connection) -> Result<(), BrokerError> {
        if self.max_connections_per_peer > 0 {
            let existing = self.peers.get(key).map_or(0, |peer| peer.connections.len());
            if existing >= self.max_connections_per_peer {
                return Err(BrokerError::ConnectionLimit(key.to_string()));
            }
        }

        let transport = connection.transport_id();
        let peer = self.get_or_create_peer(key.clone());
        peer.connections.push(connection);
        debug!(
            "Connection {} attached to {} ({} connections)",
            transport,
            key,
            peer.connections.len()
        );

        if key.role == Role::Publisher {
            let bound = self.bind_publisher_connection(&key.id, transport);
            if bound > 0 {
                debug!("Connection {} of {} bound to {} viewer connections", transport, key, bound);
            }
        }
        Ok(())
    }

    /// Remove the selected connection and close its transport
    ///
    /// The peer is removed when its last connection goes. The caller closes
    /// the returned connection's RTC session.
    pub fn detach_connection(&mut self, key: &PeerKey, selector: &ConnectionSelector) -> Option<Connection> {
        let peer = self.peers.get_mut(key)?;
        let index = peer.connections.iter().position(|c| selector.matches(c))?;
        let connection = peer.connections.remove(index);
        connection.signaling.close();
        debug!("Connection {} detached from {}", connection.transport_id(), key);

        if peer.connections.is_empty() {
            self.peers.remove(key);
            info!("Peer {} destroyed", key);
        }
        Some(connection)
    }

    /// Remove a peer and every connection it holds
    pub fn destroy_peer(&mut self, key: &PeerKey) -> Vec<Connection> {
        let Some(peer) = self.peers.remove(key) else {
            return Vec::new();
        };
        info!("Peer {} destroyed ({} connections)", key, peer.connections.len());
        peer.connections
            .into_iter()
            .inspect(|connection| connection.signaling.close())
            .collect()
    }

    /// Remove every peer, returning all of their connections
    pub fn drain(&mut self) -> Vec<Connection> {
        let keys: Vec<PeerKey> = self.peers.keys().cloned().collect();
        keys.iter().flat_map(|key| self.destroy_peer(key)).collect()
    }

    /// Append an inbound track. False if the connection is already gone.
    pub fn record_track(&mut self, key: &PeerKey, transport: TransportId, track: MediaTrack) -> bool {
        match self.peers.get_mut(key).and_then(|peer| peer.connection_mut(transport)) {
            Some(connection) => {
                connection.tracks.push(track);
                true
            }
            None => false,
        }
    }

    /// Append a data channel. False if the connection is already gone.
    pub fn record_data_channel(
        &mut self,
        key: &PeerKey,
        transport: TransportId,
        channel: Arc<dyn DataChannel>,
    ) -> bool {
        match self.peers.get_mut(key).and_then(|peer| peer.connection_mut(transport)) {
            Some(connection) => {
                connection.channels.push(channel);
                true
            }
            None => false,
        }
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peers_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connection_count(&self) -> usize {
        self.peers.values().map(|peer| peer.connections.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SignalingHandle;
    use crate::webrtc::mock::{MockDataChannel, MockRtcSession};

    fn connection(session_id: &str) -> (Connection, TransportId) {
        let (signaling, _rx) = SignalingHandle::channel();
        let transport = signaling.id();
        (Connection::new(signaling, MockRtcSession::new(session_id)), transport)
    }

    #[test]
    fn test_lookup_never_creates() {
        let registry = PeerRegistry::default();
        assert!(registry.get_peer("B", None).is_none());
        assert!(registry.get_peer("B", Some(Role::Publisher)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut registry = PeerRegistry::default();
        registry.get_or_create_peer(PeerKey::publisher("B"));
        registry.get_or_create_peer(PeerKey::publisher("B"));
        assert_eq!(registry.peer_count(), 1);
        registry.get_or_create_peer(PeerKey::viewer("B"));
        assert_eq!(registry.peer_count(), 2);
    }

    #[test]
    fn test_lookup_without_role_prefers_publisher() {
        let mut registry = PeerRegistry::default();
        let (c1, _) = connection("s1");
        let (c2, _) = connection("s2");
        registry.attach_connection(&PeerKey::viewer("A"), c1).unwrap();
        assert_eq!(registry.get_peer("A", None).unwrap().role(), Role::Viewer);
        registry.attach_connection(&PeerKey::publisher("A"), c2).unwrap();
        assert_eq!(registry.get_peer("A", None).unwrap().role(), Role::Publisher);
    }

    #[test]
    fn test_detaching_last_connection_destroys_peer() {
        let mut registry = PeerRegistry::default();
        let key = PeerKey::publisher("B");
        let (c1, t1) = connection("s1");
        let (c2, _) = connection("s2");
        registry.attach_connection(&key, c1).unwrap();
        registry.attach_connection(&key, c2).unwrap();
        assert_eq!(registry.connection_count(), 2);

        let removed = registry.detach_connection(&key, &ConnectionSelector::Transport(t1)).unwrap();
        assert!(!removed.signaling.is_open());
        assert_eq!(registry.peer_count(), 1);

        registry
            .detach_connection(&key, &ConnectionSelector::Session("s2".to_string()))
            .unwrap();
        assert!(registry.peer(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_detach_requires_both_selectors_to_match() {
        let mut registry = PeerRegistry::default();
        let key = PeerKey::viewer("V1");
        let (c1, t1) = connection("s1");
        registry.attach_connection(&key, c1).unwrap();

        let wrong = ConnectionSelector::Both(t1, "other".to_string());
        assert!(registry.detach_connection(&key, &wrong).is_none());
        let right = ConnectionSelector::Both(t1, "s1".to_string());
        assert!(registry.detach_connection(&key, &right).is_some());
        assert!(registry.detach_connection(&key, &right).is_none());
    }

    #[test]
    fn test_connection_limit() {
        let mut registry = PeerRegistry::new(1);
        let key = PeerKey::viewer("V1");
        let (c1, _) = connection("s1");
        let (c2, _) = connection("s2");
        registry.attach_connection(&key, c1).unwrap();
        assert!(matches!(
            registry.attach_connection(&key, c2),
            Err(BrokerError::ConnectionLimit(_))
        ));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_record_on_missing_connection_is_noop() {
        let mut registry = PeerRegistry::default();
        let key = PeerKey::publisher("B");
        let (c1, t1) = connection("s1");
        assert!(!registry.record_track(&key, t1, MediaTrack::video("cam", "s")));

        registry.attach_connection(&key, c1).unwrap();
        assert!(registry.record_track(&key, t1, MediaTrack::video("cam", "s")));
        assert!(registry.record_data_channel(&key, t1, MockDataChannel::new("chat")));
        assert!(!registry.record_track(&key, TransportId::new(), MediaTrack::audio("mic", "s")));

        let peer = registry.peer(&key).unwrap();
        assert_eq!(peer.connections[0].tracks.len(), 1);
        assert_eq!(peer.connections[0].channels.len(), 1);
    }

    #[test]
    fn test_destroy_peer_and_drain() {
        let mut registry = PeerRegistry::default();
        let (c1, _) = connection("s1");
        let (c2, _) = connection("s2");
        let (c3, _) = connection("s3");
        registry.attach_connection(&PeerKey::publisher("B"), c1).unwrap();
        registry.attach_connection(&PeerKey::publisher("B"), c2).unwrap();
        registry.attach_connection(&PeerKey::viewer("V1"), c3).unwrap();

        let removed = registry.destroy_peer(&PeerKey::publisher("B"));
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|c| !c.signaling.is_open()));
        assert!(registry.destroy_peer(&PeerKey::publisher("B")).is_empty());

        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
