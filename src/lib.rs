//! Voice Call - client side of a WebRTC voice call
//!
//! A call is set up through a signaling server speaking JSON over WebSocket:
//! - WebSocket signaling with reconnect-on-send
//! - WebRTC audio via `webrtc-rs`
//! - One [`CallSession`] orchestrating both

pub mod call_engine;
pub mod config;
pub mod session;
pub mod signaling;

pub use call_engine::{
    AdapterEvent, AdapterFactory, IceCandidate, MediaError, PeerConnectionAdapter,
    PeerConnectionLifecycle, SdpType, SessionDescription, WebRtcAdapter, WebRtcAdapterFactory,
};
pub use config::{CallConfig, IceServerConfig};
pub use session::{CallError, CallObserver, CallSession, CallSettings, ConfigurationError};
pub use signaling::{
    ChannelEvent, ChannelFactory, Message, SignalingChannel, SignalingState, TransportCapabilities,
    TransportStrategy, WebSocketChannel, WebSocketChannelFactory,
};
