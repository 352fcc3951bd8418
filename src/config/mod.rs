//! Configuration management for broadcast-relay

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling/HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port; privileged ports are rejected
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path for publisher/viewer signaling
    #[serde(default = "default_signaling_path")]
    pub signaling_path: String,

    /// WebSocket path for identity-less generic connections
    #[serde(default = "default_generic_path")]
    pub generic_path: String,

    /// Directory served for unmatched paths (the browser client)
    #[serde(default)]
    pub web_root: Option<PathBuf>,

    /// WebSocket keepalive ping interval, 0 disables
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            signaling_path: default_signaling_path(),
            generic_path: default_generic_path(),
            web_root: None,
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN/TURN servers offered to every session
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,

    /// Public IPs advertised as host candidates (1:1 NAT)
    #[serde(default)]
    pub nat1to1_ips: Vec<String>,

    /// Restrict ICE UDP ports to `[min, max]`
    #[serde(default)]
    pub ephemeral_udp_port_range: Option<[u16; 2]>,

    /// Trickle ICE; when false answers wait for candidate gathering
    #[serde(default = "default_ice_trickle")]
    pub ice_trickle: bool,

    /// Interval of keyframe requests sent to publishers, 0 disables
    #[serde(default = "default_keyframe_interval_ms")]
    pub keyframe_interval_ms: u64,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            nat1to1_ips: Vec::new(),
            ephemeral_udp_port_range: None,
            ice_trickle: true,
            keyframe_interval_ms: default_keyframe_interval_ms(),
        }
    }
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Period of the dangling edge sweep, 0 disables
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Maximum connections a single peer may hold, 0 means unlimited
    #[serde(default)]
    pub max_connections_per_peer: usize,

    /// Send a new offer when tracks reach an already negotiated viewer.
    /// Clients must answer it; disable for clients that only accept answers.
    #[serde(default = "default_renegotiate_tracks")]
    pub renegotiate_tracks: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_connections_per_peer: 0,
            renegotiate_tracks: default_renegotiate_tracks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.host.trim().is_empty() {
            return Err("Server host must be set".into());
        }

        if self.server.port <= 1023 {
            return Err(format!("Server port {} must be greater than 1023", self.server.port).into());
        }

        for (name, path) in [
            ("signaling_path", &self.server.signaling_path),
            ("generic_path", &self.server.generic_path),
        ] {
            if !path.starts_with('/') {
                return Err(format!("Server {} must start with '/'", name).into());
            }
        }

        if self.server.signaling_path == self.server.generic_path {
            return Err("Signaling and generic paths must differ".into());
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() || server.urls.iter().any(|url| url.trim().is_empty()) {
                return Err("ICE server entries need at least one non-empty URL".into());
            }
        }

        if let Some([min, max]) = self.webrtc.ephemeral_udp_port_range {
            if min == 0 || min > max {
                return Err("WebRTC ephemeral_udp_port_range must be [min, max] with 0 < min <= max".into());
            }
        }

        for ip in &self.webrtc.nat1to1_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(format!("WebRTC nat1to1_ips entry {} is not an IP address", ip).into());
            }
        }

        Ok(())
    }
}

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "BROADCAST_RELAY_";

impl Config {
    /// Apply `BROADCAST_RELAY_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which resolves full variable names
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            self.server.port = port
                .parse::<u16>()
                .map_err(|_| format!("{}PORT is not a valid port: {}", ENV_PREFIX, port))?;
        }
        if let Some(web_root) = var("WEB_ROOT") {
            self.server.web_root = Some(PathBuf::from(web_root));
        }
        if let Some(urls) = var("ICE_SERVERS") {
            self.webrtc.ice_servers = parse_csv_list(&urls)
                .into_iter()
                .map(|url| IceServerConfig {
                    urls: vec![url],
                    username: None,
                    credential: None,
                })
                .collect();
        }
        if let Some(trickle) = var("ICE_TRICKLE") {
            self.webrtc.ice_trickle = parse_bool(&trickle)
                .ok_or_else(|| format!("{}ICE_TRICKLE is not a boolean: {}", ENV_PREFIX, trickle))?;
        }
        if let Some(ips) = var("NAT1TO1") {
            self.webrtc.nat1to1_ips = parse_csv_list(&ips);
        }
        if let Some(renegotiate) = var("RENEGOTIATE") {
            self.broker.renegotiate_tracks = parse_bool(&renegotiate)
                .ok_or_else(|| format!("{}RENEGOTIATE is not a boolean: {}", ENV_PREFIX, renegotiate))?;
        }
        if let Some(range) = var("EPR") {
            self.webrtc.ephemeral_udp_port_range = Some(
                parse_port_range(&range)
                    .ok_or_else(|| format!("{}EPR is not a port range: {}", ENV_PREFIX, range))?,
            );
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn parse_csv_list(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    trimmed
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

fn parse_port_range(value: &str) -> Option<[u16; 2]> {
    let (start, end) = value.trim().split_once('-')?;
    let start = start.trim().parse::<u16>().ok()?;
    let end = end.trim().parse::<u16>().ok()?;
    if start == 0 || start > end {
        return None;
    }
    Some([start, end])
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_signaling_path() -> String {
    "/signaling".to_string()
}

fn default_generic_path() -> String {
    "/generic".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_ice_trickle() -> bool {
    true
}

fn default_keyframe_interval_ms() -> u64 {
    3000
}

fn default_cleanup_interval_secs() -> u64 {
    30
}

fn default_renegotiate_tracks() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}
