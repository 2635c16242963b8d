//! Command line voice call client
//!
//! Reads its configuration from the environment, places one call and hangs up
//! on Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use voice_call::{
    CallConfig, CallObserver, CallSession, CallSettings, PeerConnectionLifecycle, SignalingState,
};

// ============================================================================
// OBSERVER
// ============================================================================

struct LoggingObserver;

impl CallObserver for LoggingObserver {
    fn on_peer_connection_state(&self, state: PeerConnectionLifecycle) {
        tracing::info!("Peer connection: {:?}", state);
    }

    fn on_signaling_state(&self, state: SignalingState) {
        tracing::info!("Signaling: {:?}", state);
    }

    fn on_remote_stream(&self, stream_id: &str) {
        tracing::info!("Remote audio stream: {}", stream_id);
    }
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("voice_call=debug".parse()?)
                .add_directive("webrtc=warn".parse()?),
        )
        .init();

    let config = CallConfig::from_env();
    let token = std::env::var("CALL_TOKEN").context("CALL_TOKEN is not set")?;
    let settings = CallSettings::new(true, false)
        .with_auth_zone(std::env::var("CALL_AUTH_ZONE").is_ok_and(|v| v == "1" || v == "true"));

    tracing::info!("Calling via {}", config.base_url);

    let observer = Arc::new(LoggingObserver);
    let session = CallSession::new(config, &observer);
    session
        .start_call(Some(token), Some(settings))
        .await
        .context("failed to start call")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("Hanging up");
    session.end_call();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    while session.is_active() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Ok(())
}
