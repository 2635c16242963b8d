//! Transport strategy selection
//!
//! Both strategies speak the same WebSocket protocol and look identical to the
//! session. A persistent transport keeps the socket warm with periodic pings,
//! the fallback relies solely on reconnect-on-send.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the host environment supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Long-lived sockets survive idle periods on this platform
    pub persistent_native: bool,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            persistent_native: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStrategy {
    Persistent { keepalive: Duration },
    Fallback,
}

impl TransportStrategy {
    pub fn select(capabilities: TransportCapabilities, keepalive: Duration) -> Self {
        if capabilities.persistent_native && !keepalive.is_zero() {
            Self::Persistent { keepalive }
        } else {
            Self::Fallback
        }
    }

    pub fn keepalive(&self) -> Option<Duration> {
        match self {
            Self::Persistent { keepalive } => Some(*keepalive),
            Self::Fallback => None,
        }
    }
}
