//! Signaling protocol state machine
//!
//! One `SignalingSession` per signaling connection. It classifies inbound
//! messages (RTC relay vs. generic broker operations) and turns the RTC
//! session's events into registry and fan-out calls. The socket glue feeds it
//! from a single task, so events of one connection are handled in order.

use super::{ConnectionParams, SignalingHandle, TransportId};
use crate::broker::{Broker, BrokerError, ConnectionSelector, PeerKey, Role, ViewerHandle};
use crate::webrtc::signaling::{SdpType, SessionDescription, ViewRequest};
use crate::webrtc::{DataPayload, RtcEvent, RtcSession, RtcSessionFactory, SessionState, SignalingMessage};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-connection protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    SignalingOpen,
    RtcNegotiating,
    RtcConnected,
    Closed,
}

/// What the connection loop should do after an RTC event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct SignalingSession {
    key: PeerKey,
    signaling: SignalingHandle,
    session: Arc<dyn RtcSession>,
    broker: Arc<Broker>,
    state: ConnectionState,
}

impl SignalingSession {
    /// Handle a freshly opened signaling transport
    ///
    /// Creates the RTC session and attaches the connection to its peer. A
    /// viewer that named a broadcast owner gets that publisher's current
    /// tracks right away. On failure the transport is closed.
    pub async fn open(
        params: ConnectionParams,
        signaling: SignalingHandle,
        broker: Arc<Broker>,
        factory: &dyn RtcSessionFactory,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RtcEvent>), BrokerError> {
        let (session, events) = match factory.create_session().await {
            Ok(created) => created,
            Err(e) => {
                signaling.close();
                return Err(e.into());
            }
        };

        let key = PeerKey::new(params.peer_id.as_str(), params.role);
        if let Err(e) = broker.attach(&key, signaling.clone(), session.clone()) {
            signaling.close();
            let _ = session.close().await;
            return Err(e);
        }
        info!("New peer connected with id {} as {}", key.id, key.role);

        if key.role == Role::Viewer {
            if let Some(owner) = params.broadcast_owner_id.as_deref() {
                broker.bind_publisher_tracks(owner, &key, signaling.id()).await;
            }
        }

        let session = Self {
            key,
            signaling,
            session,
            broker,
            state: ConnectionState::SignalingOpen,
        };
        Ok((session, events))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn transport_id(&self) -> TransportId {
        self.signaling.id()
    }

    fn viewer_handle(&self) -> ViewerHandle {
        ViewerHandle::new(self.key.id.as_str(), self.signaling.id())
    }

    /// Dispatch one inbound signaling message. Malformed input is dropped.
    pub async fn handle_text(&mut self, text: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }

        let message = match SignalingMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping message from {}: {}", self.key, e);
                return;
            }
        };

        if message.is_rtc_relay() {
            self.relay_to_session(message).await;
            return;
        }

        match message {
            SignalingMessage::View { view } => self.handle_view(view).await,
            other => debug!("Ignoring unexpected message from {}: {:?}", self.key, other),
        }
    }

    /// Hand candidates and descriptions to this connection's own RTC session
    async fn relay_to_session(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Candidate { candidate } => {
                if let Err(e) = self.session.add_ice_candidate(candidate).await {
                    warn!("Remote candidate from {} rejected: {}", self.key, e);
                }
            }
            SignalingMessage::Sdp { sdp } => self.handle_description(sdp).await,
            _ => {}
        }
    }

    async fn handle_description(&mut self, description: SessionDescription) {
        let answering = description.sdp_type == SdpType::Offer;

        if let Err(e) = self.session.set_remote_description(description).await {
            warn!("Remote description from {} rejected: {}", self.key, e);
            return;
        }
        if self.state == ConnectionState::SignalingOpen {
            self.state = ConnectionState::RtcNegotiating;
        }
        if !answering {
            return;
        }

        match self.session.create_answer().await {
            Ok(answer) => {
                self.signaling.send(&SignalingMessage::sdp(answer));
            }
            Err(e) => warn!("Failed to answer {}: {}", self.key, e),
        }
    }

    async fn handle_view(&mut self, view: ViewRequest) {
        let publisher_id = view.broadcast_owner_peer_id;
        let viewer = self.viewer_handle();

        if view.leave {
            self.broker.unsubscribe(&viewer, &publisher_id);
            return;
        }

        let ack = match self.broker.subscribe(&viewer, &publisher_id).await {
            Ok(()) => SignalingMessage::view_ready(
                true,
                format!("ready now to receive broadcast from publisher : {}", publisher_id),
            ),
            Err(e) => {
                info!("Subscribe from {} to {} refused: {}", self.key, publisher_id, e);
                SignalingMessage::view_ready(false, e.to_string())
            }
        };
        self.signaling.send(&ack);
    }

    /// Handle one event raised by this connection's RTC session
    pub async fn handle_rtc_event(&mut self, event: RtcEvent) -> Flow {
        if self.state == ConnectionState::Closed {
            return Flow::Stop;
        }

        match event {
            RtcEvent::IceCandidate(candidate) => {
                self.signaling.send(&SignalingMessage::candidate(candidate));
            }
            RtcEvent::Track(track) => {
                let track_id = track.id().to_string();
                if !self.broker.publish_track(&self.key, self.signaling.id(), track).await {
                    debug!("Track {} arrived after {} detached", track_id, self.key);
                }
            }
            RtcEvent::DataChannel(channel) => {
                debug!("Data channel {} opened by {}", channel.label(), self.key);
                self.broker.record_data_channel(&self.key, self.signaling.id(), channel);
            }
            RtcEvent::ChannelMessage(text) => match DataPayload::from_json(&text) {
                Ok(payload) => {
                    self.broker.broadcast_on_data_channel(&self.key, &payload, true).await;
                }
                Err(e) => warn!("Dropping data payload from {}: {}", self.key, e),
            },
            RtcEvent::StateChange(state) => return self.handle_state_change(state).await,
        }
        Flow::Continue
    }

    async fn handle_state_change(&mut self, state: SessionState) -> Flow {
        match state {
            SessionState::Connecting => {
                self.state = ConnectionState::RtcNegotiating;
            }
            SessionState::Connected => {
                self.state = ConnectionState::RtcConnected;
                if self.key.role == Role::Publisher {
                    self.broker.notify_viewer_count(&self.key.id);
                }
            }
            SessionState::New => {}
            terminal => {
                info!("Session of {} is {:?}, tearing down", self.key, terminal);
                if self.key.role == Role::Publisher {
                    self.broker.notify_publisher_ended(&self.key.id);
                }
                let selector = ConnectionSelector::Both(self.signaling.id(), self.session.id().to_string());
                self.broker.detach(&self.key, selector).await;
                self.broker.cleanup_dangling_edges();
                self.state = ConnectionState::Closed;
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Handle the signaling transport going away
    pub async fn handle_transport_closed(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("Signaling transport of {} closed", self.key);

        if self.key.role == Role::Publisher {
            self.broker.notify_publisher_ended(&self.key.id);
        }
        self.broker.cleanup_dangling_edges();
        self.broker
            .detach(&self.key, ConnectionSelector::Transport(self.signaling.id()))
            .await;
        self.state = ConnectionState::Closed;
    }
}
