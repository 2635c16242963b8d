//! Configuration management

use crate::signaling::TransportCapabilities;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN server used when nothing else is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Signaling base URL used when `SIGNALING_URL` is unset
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Interval between keepalive pings on a persistent transport
pub const DEFAULT_KEEPALIVE_SECS: u64 = 25;

/// Time allowed for the WebSocket handshake before a dial fails
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// `http(s)://host[/path]` of the signaling server
    pub base_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub transport: TransportCapabilities,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

impl From<IceServerConfig> for RTCIceServer {
    fn from(server: IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls,
            username: server.username,
            credential: server.credential,
            ..Default::default()
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_SERVER)],
            transport: TransportCapabilities::default(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl CallConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Reads `SIGNALING_URL`, `SIGNALING_KEEPALIVE_SECS`,
    /// `SIGNALING_CONNECT_TIMEOUT_SECS` and `SIGNALING_FALLBACK_TRANSPORT`,
    /// keeping defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.base_url = url;
        }

        if let Some(secs) = lookup("SIGNALING_KEEPALIVE_SECS") {
            match secs.parse() {
                Ok(secs) => config.keepalive_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid SIGNALING_KEEPALIVE_SECS: {}", secs),
            }
        }

        if let Some(secs) = lookup("SIGNALING_CONNECT_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => config.connect_timeout_secs = secs,
                Err(_) => {
                    tracing::warn!("Ignoring invalid SIGNALING_CONNECT_TIMEOUT_SECS: {}", secs)
                }
            }
        }

        if let Some(flag) = lookup("SIGNALING_FALLBACK_TRANSPORT") {
            config.transport.persistent_native =
                !matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// Never zero; a zero setting allows one second.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}
