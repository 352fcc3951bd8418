use clap::Parser;
use std::path::PathBuf;

use broadcast_relay::config;

#[derive(Parser, Debug)]
#[command(name = "broadcast-relay")]
#[command(author = "Broadcast Relay Team")]
#[command(version)]
#[command(about = "WebRTC broadcast relay: one publisher, many viewers", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "broadcast-relay.toml")]
    pub config: PathBuf,

    /// Bind address
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory with the browser client
    #[arg(long)]
    pub web_root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    /// Load the config file, then apply environment and CLI overrides
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        let mut config = config::Config::load(&self.config)?;
        config.apply_env_overrides()?;

        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(web_root) = &self.web_root {
            config.server.web_root = Some(web_root.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        Ok(config)
    }
}
