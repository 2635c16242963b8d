//! Observer interface for session state changes

use crate::call_engine::PeerConnectionLifecycle;
use crate::signaling::SignalingState;

/// Receives every state transition of a call session.
///
/// Callbacks run on the session task and should return quickly.
pub trait CallObserver: Send + Sync {
    fn on_peer_connection_state(&self, _state: PeerConnectionLifecycle) {}

    fn on_signaling_state(&self, _state: SignalingState) {}

    fn on_remote_stream(&self, _stream_id: &str) {}
}
