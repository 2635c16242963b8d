//! Signaling Module - WebSocket channel to the call server
//!
//! This module manages communication with the signaling server:
//! - Building and keeping the WebSocket connection
//! - Encoding outbound and decoding inbound messages
//! - Reporting connectivity changes

mod channel;
mod client;
mod messages;
mod transport;

#[cfg(test)]
pub(crate) use channel::mock;
pub use channel::{
    ChannelEvent, ChannelFactory, SendReceipt, SignalingChannel, SignalingState, TransportError,
};
pub use client::{WebSocketChannel, WebSocketChannelFactory};
pub use messages::{Message, ProtocolError};
pub use transport::{TransportCapabilities, TransportStrategy};
