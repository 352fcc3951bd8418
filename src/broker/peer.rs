//! Peers, connections and subscription edges

use crate::transport::{SignalingHandle, TransportId};
use crate::webrtc::{DataChannel, MediaTrack, RtcSession};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Peer role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Originates media
    Publisher,
    /// Consumes media
    Viewer,
}

impl Role {
    /// Role from the `isSender` connection flag
    pub fn from_is_sender(is_sender: bool) -> Self {
        if is_sender {
            Role::Publisher
        } else {
            Role::Viewer
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer identity: one external id may be both a publisher and a viewer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub id: String,
    pub role: Role,
}

impl PeerKey {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }

    pub fn publisher(id: impl Into<String>) -> Self {
        Self::new(id, Role::Publisher)
    }

    pub fn viewer(id: impl Into<String>) -> Self {
        Self::new(id, Role::Viewer)
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.role)
    }
}

/// One live signaling transport + RTC session pair
pub struct Connection {
    pub signaling: SignalingHandle,
    pub session: Arc<dyn RtcSession>,
    /// Inbound media tracks, in arrival order
    pub tracks: Vec<MediaTrack>,
    pub channels: Vec<Arc<dyn DataChannel>>,
    /// IDs of relay tracks already added to `session`
    pub attached_tracks: HashSet<String>,
}

impl Connection {
    pub fn new(signaling: SignalingHandle, session: Arc<dyn RtcSession>) -> Self {
        Self {
            signaling,
            session,
            tracks: Vec::new(),
            channels: Vec::new(),
            attached_tracks: HashSet::new(),
        }
    }

    pub fn transport_id(&self) -> TransportId {
        self.signaling.id()
    }

    /// True while the RTC session has not reached a terminal state
    pub fn session_is_open(&self) -> bool {
        !self.session.state().is_terminal()
    }

    /// Data channels currently able to carry messages
    pub fn open_channels(&self) -> impl Iterator<Item = &Arc<dyn DataChannel>> {
        self.channels.iter().filter(|channel| channel.is_open())
    }
}

/// Publisher-side edge: a viewer connection watching this publisher
#[derive(Clone)]
pub struct ViewerRef {
    pub viewer_id: String,
    pub signaling: SignalingHandle,
}

impl ViewerRef {
    pub fn matches(&self, viewer_id: &str, transport: TransportId) -> bool {
        self.viewer_id == viewer_id && self.signaling.id() == transport
    }
}

/// Viewer-side edge: ties one viewer connection to one publisher connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBinding {
    pub publisher_id: String,
    pub publisher_transport: TransportId,
    pub viewer_transport: TransportId,
}

/// Edge set of a peer; its shape follows the peer's role
pub enum PeerEdges {
    Viewers(Vec<ViewerRef>),
    Sources(Vec<SourceBinding>),
}

/// Logical participant
pub struct Peer {
    key: PeerKey,
    pub connections: Vec<Connection>,
    pub edges: PeerEdges,
}

impl Peer {
    pub fn new(key: PeerKey) -> Self {
        let edges = match key.role {
            Role::Publisher => PeerEdges::Viewers(Vec::new()),
            Role::Viewer => PeerEdges::Sources(Vec::new()),
        };
        Self {
            key,
            connections: Vec::new(),
            edges,
        }
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn role(&self) -> Role {
        self.key.role
    }

    pub fn connection(&self, transport: TransportId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.transport_id() == transport)
    }

    pub fn connection_mut(&mut self, transport: TransportId) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.transport_id() == transport)
    }

    /// Viewer refs (always empty for a viewer peer)
    pub fn viewers(&self) -> &[ViewerRef] {
        match &self.edges {
            PeerEdges::Viewers(viewers) => viewers,
            PeerEdges::Sources(_) => &[],
        }
    }

    pub fn viewers_mut(&mut self) -> Option<&mut Vec<ViewerRef>> {
        match &mut self.edges {
            PeerEdges::Viewers(viewers) => Some(viewers),
            PeerEdges::Sources(_) => None,
        }
    }

    /// Source bindings (always empty for a publisher peer)
    pub fn sources(&self) -> &[SourceBinding] {
        match &self.edges {
            PeerEdges::Sources(sources) => sources,
            PeerEdges::Viewers(_) => &[],
        }
    }

    pub fn sources_mut(&mut self) -> Option<&mut Vec<SourceBinding>> {
        match &mut self.edges {
            PeerEdges::Sources(sources) => Some(sources),
            PeerEdges::Viewers(_) => None,
        }
    }

    /// Number of edges, whichever side this peer is on
    pub fn edge_count(&self) -> usize {
        match &self.edges {
            PeerEdges::Viewers(viewers) => viewers.len(),
            PeerEdges::Sources(sources) => sources.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_follow_role() {
        let mut publisher = Peer::new(PeerKey::publisher("B"));
        assert!(publisher.viewers_mut().is_some());
        assert!(publisher.sources_mut().is_none());
        assert!(publisher.sources().is_empty());

        let mut viewer = Peer::new(PeerKey::viewer("V1"));
        assert!(viewer.sources_mut().is_some());
        assert!(viewer.viewers_mut().is_none());
        assert_eq!(viewer.edge_count(), 0);
    }

    #[test]
    fn test_same_id_two_roles_are_distinct() {
        assert_ne!(PeerKey::publisher("A"), PeerKey::viewer("A"));
        assert_eq!(Role::from_is_sender(true), Role::Publisher);
        assert_eq!(Role::from_is_sender(false), Role::Viewer);
        assert_eq!(PeerKey::viewer("A").to_string(), "A (viewer)");
    }
}
