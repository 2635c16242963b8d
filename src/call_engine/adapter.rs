//! Peer connection contract
//!
//! The session never talks to a media engine directly. It drives a
//! [`PeerConnectionAdapter`] and listens to the [`AdapterEvent`]s the adapter
//! pushes into the receiver handed out by its [`AdapterFactory`].

use crate::config::IceServerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer connection is closed")]
    Closed,
}

// ============================================================================
// VALUE TYPES
// ============================================================================

/// Lifecycle of the underlying peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerConnectionLifecycle {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionLifecycle {
    /// `Failed` and `Closed` cannot be left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    #[serde(rename = "pranswer", alias = "prAnswer")]
    PrAnswer,
    Rollback,
}

/// An SDP blob together with its role in the offer/answer exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as carried over the signaling channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: u16,
}

/// Events pushed by an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    LocalCandidate(IceCandidate),
    LifecycleChanged(PeerConnectionLifecycle),
    RemoteStreamAdded { stream_id: String },
}

// ============================================================================
// CONTRACT
// ============================================================================

/// Media engine capability driven by the call session.
///
/// `create_offer`/`create_answer` also install the result as the local
/// description. Remote description and candidate application may fail; the
/// session only logs those failures. The audio switches are synchronous from
/// the caller's point of view and must not block. `close` must be idempotent.
#[async_trait]
pub trait PeerConnectionAdapter: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    fn enable_local_audio(&self, enabled: bool);

    fn enable_remote_audio(&self, enabled: bool);

    fn route_to_speaker(&self, enabled: bool);

    async fn close(&self);

    fn lifecycle(&self) -> PeerConnectionLifecycle;
}

/// Builds one adapter per call attempt.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<
        (
            Arc<dyn PeerConnectionAdapter>,
            mpsc::UnboundedReceiver<AdapterEvent>,
        ),
        MediaError,
    >;
}

// ============================================================================
// TEST DOUBLES
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================
