//! WebRTC Peer Connection Adapter
//!
//! Implements [`PeerConnectionAdapter`] on top of the `webrtc` crate.
//!
//! Audio hardware is not handled here: the local Opus track is exposed through
//! [`WebRtcAdapter::local_track`] for the embedding application to feed, and
//! remote RTP packets are rebroadcast through
//! [`WebRtcAdapter::subscribe_remote_audio`] while remote audio is enabled.

use super::adapter::{
    AdapterEvent, AdapterFactory, IceCandidate, MediaError, PeerConnectionAdapter,
    PeerConnectionLifecycle, SdpType, SessionDescription,
};
use crate::config::IceServerConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Opus runs at 48kHz
pub const SAMPLE_RATE: u32 = 48000;

const STREAM_ID: &str = "stream";
const TRACK_ID: &str = "audio0";

/// Remote RTP packets buffered per subscriber
const REMOTE_AUDIO_CAPACITY: usize = 256;

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<RTCPeerConnectionState> for PeerConnectionLifecycle {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

fn to_rtc_description(sdp: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let description = match sdp.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp.sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp.sdp),
        SdpType::PrAnswer => RTCSessionDescription::pranswer(sdp.sdp),
        SdpType::Rollback => {
            return Err(MediaError::InvalidSdp(
                "rollback cannot be applied as a remote description".to_string(),
            ))
        }
    };
    description.map_err(|e| MediaError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(description: &RTCSessionDescription) -> SessionDescription {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::PrAnswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Offer | RTCSdpType::Unspecified => SdpType::Offer,
    };
    SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    }
}

/// Media section id sent when the engine does not report one
const DEFAULT_SDP_MID: &str = "0";

fn local_candidate(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    candidate.to_json().ok().map(from_candidate_init)
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init
            .sdp_mid
            .or_else(|| Some(DEFAULT_SDP_MID.to_string())),
        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

/// Peer connection with a single Opus send track
pub struct WebRtcAdapter {
    peer_connection: Arc<RTCPeerConnection>,
    local_track: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
    lifecycle: Arc<Mutex<PeerConnectionLifecycle>>,
    local_audio: Arc<AtomicBool>,
    remote_audio: Arc<AtomicBool>,
    speaker: AtomicBool,
    closed: AtomicBool,
    /// Serializes track replacement so the latest toggle wins
    sender_update: Arc<tokio::sync::Mutex<()>>,
    remote_audio_tx: broadcast::Sender<Packet>,
}

impl WebRtcAdapter {
    /// Builds the peer connection, registers the engine callbacks and adds the
    /// local audio track.
    pub async fn new(
        ice_servers: &[IceServerConfig],
    ) -> Result<(Self, mpsc::UnboundedReceiver<AdapterEvent>), MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        // Interceptors for RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().cloned().map(Into::into).collect(),
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::WebRTC(e.to_string()))?,
        );

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            TRACK_ID.to_string(),
            STREAM_ID.to_string(),
        ));

        let sender = peer_connection
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (remote_audio_tx, _) = broadcast::channel(REMOTE_AUDIO_CAPACITY);

        let adapter = Self {
            peer_connection,
            local_track,
            sender,
            lifecycle: Arc::new(Mutex::new(PeerConnectionLifecycle::New)),
            local_audio: Arc::new(AtomicBool::new(true)),
            remote_audio: Arc::new(AtomicBool::new(true)),
            speaker: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sender_update: Arc::new(tokio::sync::Mutex::new(())),
            remote_audio_tx,
        };
        adapter.register_handlers(events_tx);

        tracing::debug!("Peer connection created");
        Ok((adapter, events_rx))
    }

    /// Local Opus track; write RTP packets here to transmit audio
    pub fn local_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.local_track)
    }

    /// Remote RTP packets, delivered only while remote audio is enabled
    pub fn subscribe_remote_audio(&self) -> broadcast::Receiver<Packet> {
        self.remote_audio_tx.subscribe()
    }

    pub fn is_local_audio_enabled(&self) -> bool {
        self.local_audio.load(Ordering::SeqCst)
    }

    pub fn is_remote_audio_enabled(&self) -> bool {
        self.remote_audio.load(Ordering::SeqCst)
    }

    pub fn is_speaker_routed(&self) -> bool {
        self.speaker.load(Ordering::SeqCst)
    }

    fn register_handlers(&self, events: mpsc::UnboundedSender<AdapterEvent>) {
        // Connection state
        let lifecycle = Arc::clone(&self.lifecycle);
        let events_clone = events.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                let state = PeerConnectionLifecycle::from(s);
                let changed = {
                    let mut current = lifecycle.lock();
                    let changed = *current != state;
                    *current = state;
                    changed
                };
                if changed {
                    let _ = events_clone.send(AdapterEvent::LifecycleChanged(state));
                }
                Box::pin(async {})
            }));

        // Local ICE candidates
        let events_clone = events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate.as_ref().and_then(local_candidate) {
                    tracing::debug!("Local candidate: {}", candidate.candidate);
                    let _ = events_clone.send(AdapterEvent::LocalCandidate(candidate));
                }
                Box::pin(async {})
            }));

        // Remote audio
        let remote_audio = Arc::clone(&self.remote_audio);
        let remote_audio_tx = self.remote_audio_tx.clone();
        self.peer_connection.on_track(Box::new(move |track, _, _| {
            let stream_id = track.stream_id();
            tracing::info!("Received track {} ({:?})", stream_id, track.codec());
            let _ = events.send(AdapterEvent::RemoteStreamAdded {
                stream_id: stream_id.clone(),
            });

            let remote_audio = Arc::clone(&remote_audio);
            let remote_audio_tx = remote_audio_tx.clone();
            Box::pin(async move {
                tokio::spawn(async move {
                    while let Ok((packet, _)) = track.read_rtp().await {
                        if remote_audio.load(Ordering::SeqCst) {
                            let _ = remote_audio_tx.send(packet);
                        }
                    }
                    tracing::debug!("Remote track {} ended", stream_id);
                });
            })
        }));
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcAdapter {
    async fn create_offer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        Ok(from_rtc_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.ensure_open()?;
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))?;

        Ok(from_rtc_description(&answer))
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), MediaError> {
        self.ensure_open()?;
        let description = to_rtc_description(sdp)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.ensure_open()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: Some(candidate.sdp_mline_index),
            ..Default::default()
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| MediaError::WebRTC(e.to_string()))
    }

    fn enable_local_audio(&self, enabled: bool) {
        self.local_audio.store(enabled, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let sender = Arc::clone(&self.sender);
        let track = Arc::clone(&self.local_track);
        let desired = Arc::clone(&self.local_audio);
        let guard = Arc::clone(&self.sender_update);
        tokio::spawn(async move {
            let _guard = guard.lock().await;
            let next = desired
                .load(Ordering::SeqCst)
                .then(|| track as Arc<dyn TrackLocal + Send + Sync>);
            if let Err(e) = sender.replace_track(next).await {
                tracing::warn!("Failed to switch local audio: {}", e);
            }
        });
    }

    fn enable_remote_audio(&self, enabled: bool) {
        self.remote_audio.store(enabled, Ordering::SeqCst);
    }

    fn route_to_speaker(&self, enabled: bool) {
        // Output port selection belongs to the host's audio stack
        self.speaker.store(enabled, Ordering::SeqCst);
        tracing::debug!("Speaker routing: {}", enabled);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        *self.lifecycle.lock() = PeerConnectionLifecycle::Closed;
    }

    fn lifecycle(&self) -> PeerConnectionLifecycle {
        *self.lifecycle.lock()
    }
}

impl std::fmt::Debug for WebRtcAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcAdapter")
            .field("lifecycle", &self.lifecycle())
            .field("local_audio", &self.is_local_audio_enabled())
            .field("remote_audio", &self.is_remote_audio_enabled())
            .field("speaker", &self.is_speaker_routed())
            .finish()
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Creates a fresh [`WebRtcAdapter`] for every call attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcAdapterFactory;

#[async_trait]
impl AdapterFactory for WebRtcAdapterFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<
        (
            Arc<dyn PeerConnectionAdapter>,
            mpsc::UnboundedReceiver<AdapterEvent>,
        ),
        MediaError,
    > {
        let (adapter, events) = WebRtcAdapter::new(ice_servers).await?;
        Ok((Arc::new(adapter), events))
    }
}

// ============================================================================
// TESTS
// ============================================================================
