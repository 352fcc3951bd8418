//! Shared state for HTTP and signaling handlers

use crate::broker::Broker;
use crate::config::Config;
use crate::webrtc::RtcSessionFactory;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared by every request handler
pub struct SharedState {
    /// Validated configuration
    pub config: Arc<Config>,

    /// Broadcast broker
    pub broker: Arc<Broker>,

    /// Factory for per-connection RTC sessions
    pub sessions: Arc<dyn RtcSessionFactory>,

    /// Server start time
    pub start_time: Instant,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("config", &self.config)
            .field("broker", &self.broker.stats())
            .finish()
    }
}

impl SharedState {
    /// Create a new shared state
    pub fn new(config: Config, broker: Arc<Broker>, sessions: Arc<dyn RtcSessionFactory>) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            sessions,
            start_time: Instant::now(),
        }
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
