//! Subscription and fan-out engine
//!
//! Owns the viewer/publisher edges. The synchronous half extends
//! `PeerRegistry` with graph operations that run under the broker lock; the
//! asynchronous half on `Broker` performs the resulting I/O (track attach,
//! renegotiation, notifications, data-channel relay) after the lock is
//! released.

use super::peer::{Peer, PeerEdges, PeerKey, Role, SourceBinding, ViewerRef};
use super::registry::PeerRegistry;
use super::{Broker, BrokerError};
use crate::transport::{SignalingHandle, TransportId};
use crate::webrtc::{DataChannel, DataPayload, MediaTrack, RtcSession, SessionState, SignalingMessage};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// The viewer connection issuing a subscribe or unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerHandle {
    pub id: String,
    pub transport: TransportId,
}

impl ViewerHandle {
    pub fn new(id: impl Into<String>, transport: TransportId) -> Self {
        Self {
            id: id.into(),
            transport,
        }
    }
}

/// Relay tracks reserved for one viewer session, to be added outside the lock
pub struct TrackAttachment {
    pub session: Arc<dyn RtcSession>,
    pub signaling: SignalingHandle,
    pub tracks: Vec<MediaTrack>,
}

impl PeerRegistry {
    /// Create the edge pair for `viewer` -> `publisher_id`
    ///
    /// Existing edges are kept, never duplicated. Returns the publisher
    /// tracks the viewer session does not carry yet.
    pub fn link_viewer(
        &mut self,
        viewer: &ViewerHandle,
        publisher_id: &str,
    ) -> Result<Option<TrackAttachment>, BrokerError> {
        let publisher_key = PeerKey::publisher(publisher_id);
        let viewer_key = PeerKey::viewer(viewer.id.as_str());

        let (publisher_transports, tracks) = {
            let publisher = self
                .peer(&publisher_key)
                .ok_or_else(|| BrokerError::PublisherNotFound(publisher_id.to_string()))?;
            let transports: Vec<TransportId> =
                publisher.connections.iter().map(|c| c.transport_id()).collect();
            let tracks: Vec<MediaTrack> = publisher
                .connections
                .iter()
                .flat_map(|c| c.tracks.iter().cloned())
                .collect();
            (transports, tracks)
        };

        let viewer_peer = self
            .peer_mut(&viewer_key)
            .ok_or_else(|| BrokerError::ViewerIdentityMismatch(viewer.id.clone()))?;
        let signaling = viewer_peer
            .connection(viewer.transport)
            .map(|c| c.signaling.clone())
            .ok_or_else(|| BrokerError::ViewerIdentityMismatch(viewer.id.clone()))?;

        if let Some(sources) = viewer_peer.sources_mut() {
            for publisher_transport in publisher_transports {
                let binding = SourceBinding {
                    publisher_id: publisher_id.to_string(),
                    publisher_transport,
                    viewer_transport: viewer.transport,
                };
                if !sources.contains(&binding) {
                    sources.push(binding);
                }
            }
        }

        if let Some(viewers) = self.peer_mut(&publisher_key).and_then(Peer::viewers_mut) {
            if !viewers.iter().any(|r| r.matches(&viewer.id, viewer.transport)) {
                viewers.push(ViewerRef {
                    viewer_id: viewer.id.clone(),
                    signaling,
                });
            }
        }

        Ok(self.reserve_tracks(&viewer_key, viewer.transport, tracks))
    }

    /// Bind a publisher's new connection to every viewer connection already
    /// subscribed to that publisher. Returns the number of bindings added.
    pub fn bind_publisher_connection(&mut self, publisher_id: &str, publisher_transport: TransportId) -> usize {
        let mut added = 0;
        for peer in self.peers_mut() {
            let Some(sources) = peer.sources_mut() else {
                continue;
            };
            let viewer_transports: Vec<TransportId> = sources
                .iter()
                .filter(|b| b.publisher_id == publisher_id)
                .map(|b| b.viewer_transport)
                .collect();

            for viewer_transport in viewer_transports {
                let binding = SourceBinding {
                    publisher_id: publisher_id.to_string(),
                    publisher_transport,
                    viewer_transport,
                };
                if !sources.contains(&binding) {
                    sources.push(binding);
                    added += 1;
                }
            }
        }
        added
    }

    /// Remove the edge pair for `viewer` -> `publisher_id`. False if there
    /// was none.
    pub fn unlink_viewer(&mut self, viewer: &ViewerHandle, publisher_id: &str) -> bool {
        let mut removed = false;

        if let Some(sources) = self
            .peer_mut(&PeerKey::viewer(viewer.id.as_str()))
            .and_then(Peer::sources_mut)
        {
            let before = sources.len();
            sources.retain(|b| !(b.publisher_id == publisher_id && b.viewer_transport == viewer.transport));
            removed |= sources.len() != before;
        }

        if let Some(viewers) = self
            .peer_mut(&PeerKey::publisher(publisher_id))
            .and_then(Peer::viewers_mut)
        {
            let before = viewers.len();
            viewers.retain(|r| !r.matches(&viewer.id, viewer.transport));
            removed |= viewers.len() != before;
        }

        removed
    }

    /// Drop every edge that refers to one connection
    ///
    /// Returns the ids of publishers that lost a viewer.
    pub fn purge_connection_edges(&mut self, key: &PeerKey, transport: TransportId) -> Vec<String> {
        let mut affected = Vec::new();
        for peer in self.peers_mut() {
            let peer_id = peer.id().to_string();
            match (&mut peer.edges, key.role) {
                (PeerEdges::Viewers(viewers), Role::Viewer) => {
                    let before = viewers.len();
                    viewers.retain(|r| !r.matches(&key.id, transport));
                    if viewers.len() != before {
                        affected.push(peer_id);
                    }
                }
                (PeerEdges::Sources(sources), Role::Publisher) => {
                    sources.retain(|b| !(b.publisher_id == key.id && b.publisher_transport == transport));
                }
                (PeerEdges::Sources(sources), Role::Viewer) if peer_id == key.id => {
                    sources.retain(|b| b.viewer_transport != transport);
                }
                _ => {}
            }
        }
        affected
    }

    /// Remove every edge whose backing connection or RTC session is gone
    ///
    /// Returns the number of edges removed; a second sweep removes nothing.
    pub fn sweep_dangling_edges(&mut self) -> usize {
        let live: HashSet<(Role, String, TransportId)> = self
            .peers()
            .flat_map(|peer| {
                peer.connections
                    .iter()
                    .filter(|c| c.session_is_open())
                    .map(move |c| (peer.role(), peer.id().to_string(), c.transport_id()))
            })
            .collect();

        let mut removed = 0;
        for peer in self.peers_mut() {
            let peer_id = peer.id().to_string();
            match &mut peer.edges {
                PeerEdges::Viewers(viewers) => {
                    let before = viewers.len();
                    viewers.retain(|r| live.contains(&(Role::Viewer, r.viewer_id.clone(), r.signaling.id())));
                    removed += before - viewers.len();
                }
                PeerEdges::Sources(sources) => {
                    let before = sources.len();
                    sources.retain(|b| {
                        live.contains(&(Role::Publisher, b.publisher_id.clone(), b.publisher_transport))
                            && live.contains(&(Role::Viewer, peer_id.clone(), b.viewer_transport))
                    });
                    removed += before - sources.len();
                }
            }
        }
        removed
    }

    /// Reserve the tracks a viewer connection does not carry yet
    fn reserve_tracks(
        &mut self,
        viewer_key: &PeerKey,
        viewer_transport: TransportId,
        tracks: Vec<MediaTrack>,
    ) -> Option<TrackAttachment> {
        let connection = self.peer_mut(viewer_key)?.connection_mut(viewer_transport)?;
        let fresh: Vec<MediaTrack> = tracks
            .into_iter()
            .filter(|track| connection.attached_tracks.insert(track.id().to_string()))
            .collect();
        if fresh.is_empty() {
            return None;
        }
        Some(TrackAttachment {
            session: connection.session.clone(),
            signaling: connection.signaling.clone(),
            tracks: fresh,
        })
    }

    /// Viewer connections bound to one publisher connection
    fn bound_viewers(&self, publisher_id: &str, publisher_transport: TransportId) -> Vec<(PeerKey, TransportId)> {
        self.peers()
            .filter(|peer| peer.role() == Role::Viewer)
            .flat_map(|peer| {
                peer.sources()
                    .iter()
                    .filter(|b| b.publisher_id == publisher_id && b.publisher_transport == publisher_transport)
                    .map(move |b| (peer.key().clone(), b.viewer_transport))
            })
            .collect()
    }
}

/// Add reserved tracks to a viewer session
///
/// With `renegotiate`, an already negotiated session gets a fresh offer; the
/// client must answer it.
async fn attach_tracks(attachment: TrackAttachment, renegotiate: bool) {
    let mut added = 0;
    for track in attachment.tracks {
        let track_id = track.id().to_string();
        let kind = track.kind();
        match attachment.session.add_track(track).await {
            Ok(()) => {
                debug!("{} track {} added to session {}", kind, track_id, attachment.session.id());
                added += 1;
            }
            Err(e) => warn!("Failed to add track {} to session {}: {}", track_id, attachment.session.id(), e),
        }
    }

    if added == 0 || !renegotiate {
        return;
    }

    match attachment.session.renegotiate().await {
        Ok(Some(offer)) => {
            if !attachment.signaling.send(&SignalingMessage::sdp(offer)) {
                debug!("Renegotiation offer dropped: transport {} is gone", attachment.signaling.id());
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Renegotiation of session {} failed: {}", attachment.session.id(), e),
    }
}

impl Broker {
    /// Subscribe a viewer connection to a publisher
    pub async fn subscribe(&self, viewer: &ViewerHandle, publisher_id: &str) -> Result<(), BrokerError> {
        let attachment = self.registry.lock().link_viewer(viewer, publisher_id)?;
        info!("Viewer {} subscribed to {}", viewer.id, publisher_id);

        if let Some(attachment) = attachment {
            attach_tracks(attachment, self.renegotiate).await;
        }

        self.cleanup_dangling_edges();
        self.notify_viewer_count(publisher_id);
        Ok(())
    }

    /// Unsubscribe a viewer connection. Missing edges are not an error.
    pub fn unsubscribe(&self, viewer: &ViewerHandle, publisher_id: &str) {
        if self.registry.lock().unlink_viewer(viewer, publisher_id) {
            info!("Viewer {} unsubscribed from {}", viewer.id, publisher_id);
        } else {
            debug!("Viewer {} was not subscribed to {}", viewer.id, publisher_id);
        }
        self.notify_viewer_count(publisher_id);
        self.cleanup_dangling_edges();
    }

    /// Send the live viewer count to every connected session of a publisher
    ///
    /// Returns the number of connections notified.
    pub fn notify_viewer_count(&self, publisher_id: &str) -> usize {
        let (count, targets) = {
            let registry = self.registry.lock();
            let Some(publisher) = registry.get_peer(publisher_id, Some(Role::Publisher)) else {
                return 0;
            };
            let count = publisher.viewers().iter().filter(|r| r.signaling.is_open()).count();
            let targets: Vec<SignalingHandle> = publisher
                .connections
                .iter()
                .filter(|c| c.session.state() == SessionState::Connected)
                .map(|c| c.signaling.clone())
                .collect();
            (count, targets)
        };

        let message = SignalingMessage::viewers_info(count);
        let sent = targets.iter().filter(|signaling| signaling.send(&message)).count();
        debug!("Viewer count {} for {} sent to {} connections", count, publisher_id, sent);
        sent
    }

    /// Tell every open viewer of a publisher that the broadcast ended
    pub fn notify_publisher_ended(&self, publisher_id: &str) -> usize {
        let targets: Vec<SignalingHandle> = self.with_registry(|registry| {
            registry
                .get_peer(publisher_id, Some(Role::Publisher))
                .map(|publisher| {
                    publisher
                        .viewers()
                        .iter()
                        .filter(|r| r.signaling.is_open())
                        .map(|r| r.signaling.clone())
                        .collect()
                })
                .unwrap_or_default()
        });

        let message = SignalingMessage::broadcast_ended(publisher_id);
        let sent = targets.iter().filter(|signaling| signaling.send(&message)).count();
        info!("Broadcast from {} ended, {} viewers notified", publisher_id, sent);
        sent
    }

    /// Relay a data-channel payload to every viewer of `sender`
    ///
    /// `senderId` is stamped with the sender's id. Closed channels are
    /// skipped. Returns the number of channels the payload was delivered to.
    pub async fn broadcast_on_data_channel(
        &self,
        sender: &PeerKey,
        payload: &DataPayload,
        include_self: bool,
    ) -> usize {
        let channels: Vec<Arc<dyn DataChannel>> = {
            let registry = self.registry.lock();
            let Some(sender_peer) = registry.peer(sender) else {
                debug!("Dropping data payload from unknown peer {}", sender);
                return 0;
            };

            let mut viewer_ids: Vec<&str> = sender_peer.viewers().iter().map(|r| r.viewer_id.as_str()).collect();
            viewer_ids.sort_unstable();
            viewer_ids.dedup();

            let mut channels: Vec<Arc<dyn DataChannel>> = viewer_ids
                .into_iter()
                .filter_map(|id| registry.get_peer(id, Some(Role::Viewer)))
                .flat_map(|viewer| viewer.connections.iter())
                .flat_map(|c| c.open_channels().cloned())
                .collect();

            if include_self {
                channels.extend(sender_peer.connections.iter().flat_map(|c| c.open_channels().cloned()));
            }
            channels
        };

        let text = match payload.stamped(&sender.id).to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize data payload from {}: {}", sender, e);
                return 0;
            }
        };

        let mut delivered = 0;
        for channel in channels {
            match channel.send_text(text.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Skipping data channel {}: {}", channel.label(), e),
            }
        }
        debug!("Data payload from {} delivered to {} channels", sender, delivered);
        delivered
    }

    /// Sweep edges whose backing session is gone
    pub fn cleanup_dangling_edges(&self) -> usize {
        let removed = self.registry.lock().sweep_dangling_edges();
        if removed > 0 {
            debug!("Removed {} dangling edges", removed);
        }
        removed
    }

    /// Clone the tracks of a publisher's first connection onto a freshly
    /// opened viewer connection
    pub async fn bind_publisher_tracks(&self, publisher_id: &str, viewer_key: &PeerKey, transport: TransportId) {
        let attachment = {
            let mut registry = self.registry.lock();
            let tracks: Vec<MediaTrack> = registry
                .get_peer(publisher_id, Some(Role::Publisher))
                .and_then(|publisher| publisher.connections.first())
                .map(|c| c.tracks.clone())
                .unwrap_or_default();
            if tracks.is_empty() {
                return;
            }
            registry.reserve_tracks(viewer_key, transport, tracks)
        };

        if let Some(attachment) = attachment {
            attach_tracks(attachment, self.renegotiate).await;
        }
    }

    /// Record an inbound track and clone it onto every viewer connection
    /// bound to the publishing connection
    ///
    /// Returns false if the connection is already gone.
    pub async fn publish_track(&self, key: &PeerKey, transport: TransportId, track: MediaTrack) -> bool {
        let attachments: Vec<TrackAttachment> = {
            let mut registry = self.registry.lock();
            if !registry.record_track(key, transport, track.clone()) {
                return false;
            }
            if key.role != Role::Publisher {
                return true;
            }
            registry
                .bound_viewers(&key.id, transport)
                .into_iter()
                .filter_map(|(viewer_key, viewer_transport)| {
                    registry.reserve_tracks(&viewer_key, viewer_transport, vec![track.clone()])
                })
                .collect()
        };

        for attachment in attachments {
            attach_tracks(attachment, self.renegotiate).await;
        }
        true
    }
}
