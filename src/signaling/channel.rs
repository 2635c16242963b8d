//! Signaling channel contract
//!
//! A channel moves [`Message`]s to and from the signaling server and reports
//! its connectivity through [`ChannelEvent`]s. All methods return immediately;
//! their effects show up as events or through the returned [`SendReceipt`].

use super::messages::Message;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Signaling channel closed")]
    Closed,
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignalingState {
    #[default]
    Idle,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Emitted only when the state actually changes
    StateChanged(SignalingState),
    /// A successfully decoded inbound message
    Message(Message),
}

// ============================================================================
// SEND RECEIPT
// ============================================================================

/// Resolves once the transport accepted the write or the send failed.
///
/// A receipt always resolves: if the channel goes away before handling the
/// send, it resolves to [`TransportError::Closed`].
#[derive(Debug)]
pub struct SendReceipt(oneshot::Receiver<Result<(), TransportError>>);

impl SendReceipt {
    /// Creates a receipt and the sender used to complete it.
    pub fn channel() -> (oneshot::Sender<Result<(), TransportError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    /// A receipt that is already complete
    pub fn ready(result: Result<(), TransportError>) -> Self {
        let (tx, receipt) = Self::channel();
        let _ = tx.send(result);
        receipt
    }

    pub async fn completed(self) -> Result<(), TransportError> {
        self.0.await.unwrap_or(Err(TransportError::Closed))
    }
}

// ============================================================================
// CONTRACT
// ============================================================================

pub trait SignalingChannel: Send + Sync {
    fn state(&self) -> SignalingState;

    fn connect(&self);

    fn disconnect(&self);

    /// Queues `message` behind every earlier send on this channel.
    fn send(&self, message: Message) -> SendReceipt;
}

/// Builds one channel per call attempt.
pub trait ChannelFactory: Send + Sync {
    fn create(
        &self,
        url: Url,
    ) -> (
        Arc<dyn SignalingChannel>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    );
}

// ============================================================================
// TEST DOUBLES
// ============================================================================
