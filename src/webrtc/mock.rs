//! Mock implementations for testing
//!
//! In-memory sessions, data channels and a session factory that record what
//! the broker asked of them, so broker flows can be driven without a media
//! engine. Events are injected through the sender kept by the factory.

use super::media_track::MediaTrack;
use super::session::{DataChannel, RtcEvent, RtcSession, RtcSessionFactory, SessionState};
use super::signaling::{IceCandidate, SessionDescription};
use super::WebRTCError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Mock RTC session
// ============================================================================

/// Recording `RtcSession`
pub struct MockRtcSession {
    id: String,
    state: Mutex<SessionState>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: Mutex<Vec<String>>,
    close_calls: Mutex<usize>,
    failing: AtomicBool,
}

impl MockRtcSession {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: Mutex::new(SessionState::New),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            close_calls: Mutex::new(0),
            failing: AtomicBool::new(false),
        })
    }

    /// Force the reported connection state
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Make every fallible operation return an error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    /// IDs of the tracks added so far, in order
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        *self.close_calls.lock()
    }

    pub fn is_closed(&self) -> bool {
        *self.state.lock() == SessionState::Closed
    }

    fn check(&self, what: &str) -> Result<(), WebRTCError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WebRTCError::ConnectionFailed(format!("mock {} failure", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcSession for MockRtcSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), WebRTCError> {
        self.check("set_remote_description")?;
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, WebRTCError> {
        self.check("create_answer")?;
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.id)))
    }

    async fn renegotiate(&self) -> Result<Option<SessionDescription>, WebRTCError> {
        self.check("renegotiate")?;
        if self.remote_descriptions.lock().is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionDescription::offer(format!("mock-offer-{}", self.id))))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        self.check("add_ice_candidate")?;
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: MediaTrack) -> Result<(), WebRTCError> {
        self.check("add_track")?;
        self.tracks.lock().push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        *self.close_calls.lock() += 1;
        *self.state.lock() = SessionState::Closed;
        Ok(())
    }
}

// ============================================================================
// Mock data channel
// ============================================================================

/// Recording `DataChannel`
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockDataChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Text messages delivered so far
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), WebRTCError> {
        if !self.is_open() {
            return Err(WebRTCError::DataChannelError(format!("{} is closed", self.label)));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

// ============================================================================
// Mock session factory
// ============================================================================

/// Session factory that hands out `MockRtcSession`s and keeps their event
/// senders for injection
#[derive(Default)]
pub struct MockSessionFactory {
    created: Mutex<Vec<(Arc<MockRtcSession>, mpsc::UnboundedSender<RtcEvent>)>>,
    failing: AtomicBool,
}

impl MockSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `create_session` fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Session created by the `index`-th call
    pub fn session(&self, index: usize) -> Option<Arc<MockRtcSession>> {
        self.created.lock().get(index).map(|(session, _)| session.clone())
    }

    /// Inject an event into the `index`-th session's stream
    pub fn emit(&self, index: usize, event: RtcEvent) -> bool {
        match self.created.lock().get(index) {
            Some((_, tx)) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RtcSessionFactory for MockSessionFactory {
    async fn create_session(
        &self,
    ) -> Result<(Arc<dyn RtcSession>, mpsc::UnboundedReceiver<RtcEvent>), WebRTCError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WebRTCError::ConnectionFailed("mock factory failure".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut created = self.created.lock();
        let session = MockRtcSession::new(format!("mock-session-{}", created.len()));
        created.push((session.clone(), tx));
        let session: Arc<dyn RtcSession> = session;
        Ok((session, rx))
    }
}
