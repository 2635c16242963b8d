//! Per-call audio settings

use serde::{Deserialize, Serialize};

/// Audio settings cached by the session and applied once media is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSettings {
    pub mic_enabled: bool,
    pub speaker_enabled: bool,
    /// Sent along with the offer
    pub auth_zone: bool,
    /// Remote audio playback
    pub output_enabled: bool,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            mic_enabled: false,
            speaker_enabled: false,
            auth_zone: false,
            output_enabled: true,
        }
    }
}

impl CallSettings {
    pub fn new(mic_enabled: bool, speaker_enabled: bool) -> Self {
        Self {
            mic_enabled,
            speaker_enabled,
            ..Default::default()
        }
    }

    pub fn with_auth_zone(mut self, auth_zone: bool) -> Self {
        self.auth_zone = auth_zone;
        self
    }
}
