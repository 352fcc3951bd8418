//! broadcast-relay - Main entry point
//!
//! WebRTC broadcast relay: publishers stream media to a server-side peer
//! connection which fans it out to every subscribed viewer.

use broadcast_relay::broker::Broker;
use broadcast_relay::web::{run_http_server, SharedState};
use broadcast_relay::webrtc::PeerConnectionManager;
use clap::Parser;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

mod args;

use args::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config from {:?}: {}", args.config, e);
            return Err(e);
        }
    };

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("BROADCAST_RELAY_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_srtp", log::LevelFilter::Warn)
        .init();

    info!("broadcast-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", args.config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let broker = Arc::new(Broker::new(&config.broker));
    let sessions = Arc::new(PeerConnectionManager::new(config.webrtc.clone()));
    info!(
        "WebRTC sessions use {} ICE server(s), trickle={}",
        config.webrtc.ice_servers.len(),
        config.webrtc.ice_trickle
    );

    let cleanup_task = spawn_cleanup_task(broker.clone(), config.broker.cleanup_interval_secs);

    let state = Arc::new(SharedState::new(config, broker.clone(), sessions));

    let shutdown = {
        let broker = broker.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
            broker.shutdown().await;
        }
    };

    let result = run_http_server(state, shutdown).await;

    if let Some(task) = cleanup_task {
        task.abort();
    }
    broker.shutdown().await;

    match result {
        Ok(()) => {
            info!("broadcast-relay stopped");
            Ok(())
        }
        Err(e) => {
            error!("HTTP server error: {}", e);
            Err(e)
        }
    }
}

/// Periodically sweep subscription edges whose endpoints are gone
fn spawn_cleanup_task(broker: Arc<Broker>, interval_secs: u64) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = broker.cleanup_dangling_edges();
            if removed > 0 {
                debug!("Removed {} dangling subscription edges", removed);
            }
        }
    }))
}
