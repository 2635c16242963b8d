//! Call session orchestrator
//!
//! [`CallSession`] is a cheap handle; the state lives in a single actor task.
//! Public operations, channel events, adapter events and the completions of
//! spawned work all arrive through one inbox and are handled one at a time.
//!
//! Every channel event, adapter event and async completion is tagged with the
//! generation that was current when it was issued. Starting or disposing a
//! call bumps the generation, so anything still in flight from an older
//! attempt is recognised as stale and dropped.

use super::endpoint::channel_url;
use super::error::{CallError, ConfigurationError};
use super::observer::CallObserver;
use super::settings::CallSettings;
use crate::call_engine::{
    AdapterEvent, AdapterFactory, IceCandidate, MediaError, PeerConnectionAdapter,
    PeerConnectionLifecycle, SessionDescription, WebRtcAdapterFactory,
};
use crate::config::CallConfig;
use crate::signaling::{
    ChannelEvent, ChannelFactory, Message, SignalingChannel, SignalingState, TransportStrategy,
    WebSocketChannelFactory,
};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// ============================================================================
// INBOX
// ============================================================================

#[derive(Debug)]
enum Command {
    StartCall {
        token: Option<String>,
        settings: Option<CallSettings>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall,
    Disconnect,
    SetMicrophone(bool),
    SetSpeakerphone(bool),
    SetAudioOutput(bool),
    SendDigit(String),
    Shutdown,
}

#[derive(Debug)]
enum Inbox {
    Command(Command),
    Channel {
        generation: u64,
        event: ChannelEvent,
    },
    Adapter {
        generation: u64,
        event: AdapterEvent,
    },
    OfferCreated {
        generation: u64,
        offer: Result<SessionDescription, MediaError>,
    },
    HangupSent {
        generation: u64,
    },
}

/// Remote negotiation steps, applied strictly in order
#[derive(Debug)]
enum RemoteOp {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// What the handle's getters read
#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    active: bool,
    signaling: SignalingState,
    peer: PeerConnectionLifecycle,
    settings: CallSettings,
}

// ============================================================================
// PUBLIC HANDLE
// ============================================================================

/// Drives one voice call at a time.
///
/// Must be created inside a Tokio runtime. Dropping the handle tears down any
/// active call without sending a hangup.
pub struct CallSession {
    inbox: mpsc::UnboundedSender<Inbox>,
    snapshot: Arc<RwLock<Snapshot>>,
}

impl CallSession {
    /// Session using the WebSocket channel and the WebRTC adapter.
    ///
    /// The observer is held weakly; keep it alive for as long as you want
    /// notifications.
    pub fn new<O: CallObserver + 'static>(config: CallConfig, observer: &Arc<O>) -> Self {
        let strategy = TransportStrategy::select(config.transport, config.keepalive());
        tracing::debug!("Using {:?} signaling transport", strategy);
        let channels = WebSocketChannelFactory::new(strategy, config.connect_timeout());
        Self::with_factories(
            config,
            observer,
            Arc::new(channels),
            Arc::new(WebRtcAdapterFactory),
        )
    }

    pub fn with_factories<O: CallObserver + 'static>(
        config: CallConfig,
        observer: &Arc<O>,
        channels: Arc<dyn ChannelFactory>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        let observer: Weak<O> = Arc::downgrade(observer);
        let observer: Weak<dyn CallObserver> = observer;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));

        let actor = SessionActor::new(
            config,
            channels,
            adapters,
            observer,
            inbox_tx.clone(),
            Arc::clone(&snapshot),
        );
        tokio::spawn(actor.run(inbox_rx));

        Self {
            inbox: inbox_tx,
            snapshot,
        }
    }

    /// Starts a call, adopting `token` and `settings` when given.
    ///
    /// Fails when a call is already active, no token is known, the base URL is
    /// unusable or the media engine cannot be set up. Nothing is started on
    /// failure.
    pub async fn start_call(
        &self,
        token: Option<String>,
        settings: Option<CallSettings>,
    ) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::StartCall {
            token,
            settings,
            reply,
        });
        rx.await.unwrap_or(Err(CallError::SessionClosed))
    }

    /// Sends a hangup and tears the call down once the send has completed,
    /// whether or not it reached the server.
    pub fn end_call(&self) {
        self.command(Command::EndCall);
    }

    /// Tears the call down without notifying the remote side. Takes effect
    /// before any operation issued after it.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn set_microphone(&self, enabled: bool) {
        self.command(Command::SetMicrophone(enabled));
    }

    pub fn set_speakerphone(&self, enabled: bool) {
        self.command(Command::SetSpeakerphone(enabled));
    }

    pub fn set_audio_output(&self, enabled: bool) {
        self.command(Command::SetAudioOutput(enabled));
    }

    pub fn send_digit(&self, digit: impl Into<String>) {
        self.command(Command::SendDigit(digit.into()));
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.snapshot.read().signaling
    }

    pub fn peer_connection_state(&self) -> PeerConnectionLifecycle {
        self.snapshot.read().peer
    }

    pub fn settings(&self) -> CallSettings {
        self.snapshot.read().settings
    }

    pub fn is_active(&self) -> bool {
        self.snapshot.read().active
    }

    fn command(&self, command: Command) {
        if self.inbox.send(Inbox::Command(command)).is_err() {
            tracing::warn!("Call session task is gone");
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let _ = self.inbox.send(Inbox::Command(Command::Shutdown));
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("snapshot", &*self.snapshot.read())
            .finish()
    }
}

// ============================================================================
// ACTOR
// ============================================================================

/// Resources of one call attempt
struct Attempt {
    channel: Arc<dyn SignalingChannel>,
    adapter: Arc<dyn PeerConnectionAdapter>,
    remote_ops: mpsc::UnboundedSender<RemoteOp>,
    tasks: Vec<JoinHandle<()>>,
    offer_sent: bool,
    answer_received: bool,
    pending_candidates: Vec<IceCandidate>,
}

struct SessionActor {
    config: CallConfig,
    channels: Arc<dyn ChannelFactory>,
    adapters: Arc<dyn AdapterFactory>,
    observer: Weak<dyn CallObserver>,
    inbox: mpsc::UnboundedSender<Inbox>,
    snapshot: Arc<RwLock<Snapshot>>,
    token: Option<String>,
    settings: CallSettings,
    attempt: Option<Attempt>,
    generation: u64,
    signaling: SignalingState,
    peer: PeerConnectionLifecycle,
}

impl SessionActor {
    fn new(
        config: CallConfig,
        channels: Arc<dyn ChannelFactory>,
        adapters: Arc<dyn AdapterFactory>,
        observer: Weak<dyn CallObserver>,
        inbox: mpsc::UnboundedSender<Inbox>,
        snapshot: Arc<RwLock<Snapshot>>,
    ) -> Self {
        Self {
            config,
            channels,
            adapters,
            observer,
            inbox,
            snapshot,
            token: None,
            settings: CallSettings::default(),
            attempt: None,
            generation: 0,
            signaling: SignalingState::Idle,
            peer: PeerConnectionLifecycle::New,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbox>) {
        while let Some(item) = inbox.recv().await {
            let shutdown = matches!(item, Inbox::Command(Command::Shutdown));
            self.handle(item).await;
            if shutdown {
                break;
            }
        }
        tracing::debug!("Call session task stopped");
    }

    async fn handle(&mut self, item: Inbox) {
        match item {
            Inbox::Command(command) => self.handle_command(command).await,

            Inbox::Channel { generation, event } => {
                if self.is_current(generation) {
                    self.handle_channel_event(event);
                } else {
                    tracing::trace!("Dropping stale channel event {:?}", event);
                }
            }

            Inbox::Adapter { generation, event } => {
                if self.is_current(generation) {
                    self.handle_adapter_event(event);
                } else {
                    tracing::trace!("Dropping stale adapter event {:?}", event);
                }
            }

            Inbox::OfferCreated { generation, offer } => {
                if self.is_current(generation) {
                    self.send_offer(offer);
                } else {
                    tracing::debug!("Discarding offer from generation {}", generation);
                }
            }

            Inbox::HangupSent { generation } => {
                if self.is_current(generation) {
                    self.dispose();
                }
            }
        }
        self.publish();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.attempt.is_some() && self.generation == generation
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                token,
                settings,
                reply,
            } => {
                let result = self.start_call(token, settings).await;
                if let Err(e) = &result {
                    tracing::error!("start_call failed: {}", e);
                }
                self.publish();
                let _ = reply.send(result);
            }

            Command::EndCall => self.end_call(),

            Command::Disconnect | Command::Shutdown => self.dispose(),

            Command::SetMicrophone(enabled) => {
                self.settings.mic_enabled = enabled;
                if let Some(adapter) = self.connected_adapter() {
                    adapter.enable_local_audio(enabled);
                }
            }

            Command::SetSpeakerphone(enabled) => {
                self.settings.speaker_enabled = enabled;
                if let Some(adapter) = self.connected_adapter() {
                    adapter.route_to_speaker(enabled);
                }
            }

            Command::SetAudioOutput(enabled) => {
                self.settings.output_enabled = enabled;
                if let Some(adapter) = self.connected_adapter() {
                    adapter.enable_remote_audio(enabled);
                }
            }

            Command::SendDigit(digit) => match &self.attempt {
                Some(attempt) => {
                    tracing::debug!("Sending DTMF digit {}", digit);
                    let _ = attempt.channel.send(Message::Dtmf { digit });
                }
                None => tracing::debug!("send_digit ignored, no active call"),
            },
        }
    }

    async fn start_call(
        &mut self,
        token: Option<String>,
        settings: Option<CallSettings>,
    ) -> Result<(), CallError> {
        if self.attempt.is_some() {
            return Err(CallError::AlreadyActive);
        }

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
        if let Some(settings) = settings {
            self.settings = settings;
        }

        let token = self
            .token
            .as_deref()
            .ok_or(ConfigurationError::MissingToken)?;
        let url = channel_url(&self.config.base_url, token)?;

        let (channel, channel_events) = self.channels.create(url);
        let (adapter, adapter_events) = self.adapters.create(&self.config.ice_servers).await?;

        self.generation += 1;
        let generation = self.generation;

        let (remote_ops, remote_ops_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            forward(channel_events, self.inbox.clone(), move |event| {
                Inbox::Channel { generation, event }
            }),
            forward(adapter_events, self.inbox.clone(), move |event| {
                Inbox::Adapter { generation, event }
            }),
            tokio::spawn(apply_remote_ops(Arc::clone(&adapter), remote_ops_rx)),
        ];

        let signaling = channel.state();
        let peer = adapter.lifecycle();
        self.attempt = Some(Attempt {
            channel: Arc::clone(&channel),
            adapter,
            remote_ops,
            tasks,
            offer_sent: false,
            answer_received: false,
            pending_candidates: Vec::new(),
        });
        self.set_signaling_state(signaling);
        self.set_peer_state(peer);

        channel.connect();
        tracing::info!("Call started (generation {})", generation);
        Ok(())
    }

    fn end_call(&mut self) {
        let Some(attempt) = &self.attempt else {
            tracing::debug!("end_call ignored, no active call");
            return;
        };

        tracing::debug!("Sending hangup");
        let receipt = attempt.channel.send(Message::Hangup);
        let inbox = self.inbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if let Err(e) = receipt.completed().await {
                tracing::warn!("Hangup not delivered: {}", e);
            }
            let _ = inbox.send(Inbox::HangupSent { generation });
        });
    }

    /// Releases the current attempt. Safe to call when idle.
    fn dispose(&mut self) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };

        for task in &attempt.tasks {
            task.abort();
        }
        attempt.channel.disconnect();
        let adapter = attempt.adapter;
        tokio::spawn(async move {
            adapter.close().await;
        });

        self.generation += 1;
        self.set_signaling_state(SignalingState::Disconnected);
        self.set_peer_state(PeerConnectionLifecycle::Closed);
        tracing::info!("Call disposed");
    }

    // ------------------------------------------------------------------------
    // Channel events
    // ------------------------------------------------------------------------

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged(state) => {
                self.set_signaling_state(state);
                match state {
                    SignalingState::Connected => self.request_offer(),
                    SignalingState::Disconnected => {
                        tracing::info!("Signaling channel lost, ending call");
                        self.dispose();
                    }
                    SignalingState::Idle => {}
                }
            }
            ChannelEvent::Message(Message::Hangup) => {
                tracing::info!("Remote hangup");
                self.dispose();
            }
            ChannelEvent::Message(message) => self.handle_message(message),
        }
    }

    fn request_offer(&mut self) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if attempt.offer_sent {
            tracing::debug!("Offer already requested for generation {}", self.generation);
            return;
        }
        attempt.offer_sent = true;

        let adapter = Arc::clone(&attempt.adapter);
        let inbox = self.inbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let offer = adapter.create_offer().await;
            let _ = inbox.send(Inbox::OfferCreated { generation, offer });
        });
    }

    fn send_offer(&mut self, offer: Result<SessionDescription, MediaError>) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        match offer {
            Ok(sdp) => {
                tracing::debug!("Sending call offer");
                let _ = attempt.channel.send(Message::Call {
                    sdp,
                    auth_zone: self.settings.auth_zone,
                });
            }
            Err(e) => tracing::error!("Failed to create offer: {}", e),
        }
    }

    fn handle_message(&mut self, message: Message) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };

        match message {
            Message::Answer { sdp } => {
                tracing::debug!("Answer received");
                attempt.answer_received = true;
                let _ = attempt
                    .remote_ops
                    .send(RemoteOp::Description(SessionDescription::answer(sdp)));
                for candidate in attempt.pending_candidates.drain(..) {
                    let _ = attempt.remote_ops.send(RemoteOp::Candidate(candidate));
                }
            }

            Message::Candidate(candidate) => {
                if attempt.answer_received {
                    let _ = attempt.remote_ops.send(RemoteOp::Candidate(candidate));
                } else {
                    tracing::debug!("Buffering candidate until the answer arrives");
                    attempt.pending_candidates.push(candidate);
                }
            }

            other => tracing::debug!("Ignoring unexpected {} message", other.event()),
        }
    }

    // ------------------------------------------------------------------------
    // Adapter events
    // ------------------------------------------------------------------------

    fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::LocalCandidate(candidate) => {
                if let Some(attempt) = &self.attempt {
                    let _ = attempt.channel.send(Message::Candidate(candidate));
                }
            }

            AdapterEvent::LifecycleChanged(state) => {
                if self.peer.is_terminal() {
                    tracing::debug!("Ignoring {:?} after {:?}", state, self.peer);
                    return;
                }
                if state.is_terminal() {
                    tracing::warn!(
                        "Peer connection ended ({:?}), call stays up until hangup",
                        state
                    );
                }
                let entering_connected = state == PeerConnectionLifecycle::Connected
                    && self.peer != PeerConnectionLifecycle::Connected;
                self.set_peer_state(state);
                if entering_connected {
                    self.apply_settings();
                }
            }

            AdapterEvent::RemoteStreamAdded { stream_id } => {
                tracing::debug!("Remote stream added: {}", stream_id);
                if let Some(observer) = self.observer.upgrade() {
                    observer.on_remote_stream(&stream_id);
                }
            }
        }
    }

    fn apply_settings(&self) {
        if let Some(attempt) = &self.attempt {
            tracing::debug!("Applying settings {:?}", self.settings);
            attempt.adapter.enable_local_audio(self.settings.mic_enabled);
            attempt.adapter.route_to_speaker(self.settings.speaker_enabled);
            attempt.adapter.enable_remote_audio(self.settings.output_enabled);
        }
    }

    fn connected_adapter(&self) -> Option<&Arc<dyn PeerConnectionAdapter>> {
        if self.peer != PeerConnectionLifecycle::Connected {
            return None;
        }
        self.attempt.as_ref().map(|attempt| &attempt.adapter)
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn set_signaling_state(&mut self, state: SignalingState) {
        if self.signaling == state {
            return;
        }
        self.signaling = state;
        tracing::info!("Signaling state: {:?}", state);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_signaling_state(state);
        }
    }

    fn set_peer_state(&mut self, state: PeerConnectionLifecycle) {
        if self.peer == state {
            return;
        }
        self.peer = state;
        tracing::info!("Peer connection state: {:?}", state);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_peer_connection_state(state);
        }
    }

    fn publish(&self) {
        *self.snapshot.write() = Snapshot {
            active: self.attempt.is_some(),
            signaling: self.signaling,
            peer: self.peer,
            settings: self.settings,
        };
    }
}

/// Forwards events into the inbox, tagging them on the way.
fn forward<T: Send + 'static>(
    mut events: mpsc::UnboundedReceiver<T>,
    inbox: mpsc::UnboundedSender<Inbox>,
    wrap: impl Fn(T) -> Inbox + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inbox.send(wrap(event)).is_err() {
                break;
            }
        }
    })
}

async fn apply_remote_ops(
    adapter: Arc<dyn PeerConnectionAdapter>,
    mut ops: mpsc::UnboundedReceiver<RemoteOp>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            RemoteOp::Description(sdp) => match adapter.set_remote_description(sdp).await {
                Ok(()) => tracing::debug!("Remote description set"),
                Err(e) => tracing::warn!("Failed to set remote description: {}", e),
            },
            RemoteOp::Candidate(candidate) => {
                if let Err(e) = adapter.add_remote_candidate(candidate).await {
                    tracing::warn!("Failed to add remote candidate: {}", e);
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::mock::{AdapterCall, MockAdapter, MockAdapterFactory};
    use crate::signaling::mock::{MockChannel, MockChannelFactory};
    use crate::signaling::TransportError;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Observed {
        Peer(PeerConnectionLifecycle),
        Signaling(SignalingState),
        Stream(String),
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<Observed>>,
        notify: Mutex<Option<mpsc::UnboundedSender<Observed>>>,
    }

    impl RecordingObserver {
        fn record(&self, observed: Observed) {
            if let Some(tx) = self.notify.lock().as_ref() {
                let _ = tx.send(observed.clone());
            }
            self.seen.lock().push(observed);
        }

        fn seen(&self) -> Vec<Observed> {
            self.seen.lock().clone()
        }
    }

    impl CallObserver for RecordingObserver {
        fn on_peer_connection_state(&self, state: PeerConnectionLifecycle) {
            self.record(Observed::Peer(state));
        }

        fn on_signaling_state(&self, state: SignalingState) {
            self.record(Observed::Signaling(state));
        }

        fn on_remote_stream(&self, stream_id: &str) {
            self.record(Observed::Stream(stream_id.to_string()));
        }
    }

    /// Runs the actor by hand so every step is deterministic.
    struct Harness {
        actor: SessionActor,
        inbox: mpsc::UnboundedReceiver<Inbox>,
        channels: Arc<MockChannelFactory>,
        adapters: Arc<MockAdapterFactory>,
        observer: Arc<RecordingObserver>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_adapters(MockAdapterFactory::default())
        }

        fn with_adapters(adapters: MockAdapterFactory) -> Self {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let channels = Arc::new(MockChannelFactory::default());
            let adapters = Arc::new(adapters);
            let observer = Arc::new(RecordingObserver::default());
            let weak: Weak<RecordingObserver> = Arc::downgrade(&observer);
            let weak: Weak<dyn CallObserver> = weak;

            let actor = SessionActor::new(
                CallConfig::new("https://host"),
                channels.clone(),
                adapters.clone(),
                weak,
                inbox_tx,
                Arc::new(RwLock::new(Snapshot::default())),
            );

            Self {
                actor,
                inbox,
                channels,
                adapters,
                observer,
            }
        }

        async fn command(&mut self, command: Command) {
            self.actor.handle(Inbox::Command(command)).await;
            self.pump().await;
        }

        async fn start_with(
            &mut self,
            token: Option<&str>,
            settings: Option<CallSettings>,
        ) -> Result<(), CallError> {
            let (reply, rx) = oneshot::channel();
            self.command(Command::StartCall {
                token: token.map(str::to_string),
                settings,
                reply,
            })
            .await;
            rx.await.unwrap()
        }

        async fn start(&mut self) -> Result<(), CallError> {
            self.start_with(Some("abc"), None).await
        }

        /// Lets spawned work finish and feeds everything it produced back in.
        async fn pump(&mut self) {
            loop {
                settle().await;
                match self.inbox.try_recv() {
                    Ok(item) => self.actor.handle(item).await,
                    Err(_) => break,
                }
            }
        }

        fn channel(&self) -> Arc<MockChannel> {
            self.channels.last()
        }

        fn adapter(&self) -> Arc<MockAdapter> {
            self.adapters.last()
        }

        async fn connect_signaling(&mut self) {
            self.channel().set_state(SignalingState::Connected);
            self.pump().await;
        }

        async fn deliver(&mut self, message: Message) {
            self.channel().deliver(message);
            self.pump().await;
        }

        async fn peer(&mut self, state: PeerConnectionLifecycle) {
            self.adapter().emit(AdapterEvent::LifecycleChanged(state));
            self.pump().await;
        }

        fn calls_on_channel(&self) -> Vec<Message> {
            self.channel().sent()
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn candidate(sdp: &str) -> IceCandidate {
        IceCandidate {
            candidate: sdp.to_string(),
            sdp_mid: None,
            sdp_mline_index: 0,
        }
    }

    fn audio_calls(adapter: &MockAdapter) -> Vec<AdapterCall> {
        adapter
            .calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    AdapterCall::LocalAudio(_)
                        | AdapterCall::RemoteAudio(_)
                        | AdapterCall::Speaker(_)
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_start_call_builds_channel_url_and_connects() {
        let mut h = Harness::new();
        h.start().await.unwrap();

        let channel = h.channel();
        assert_eq!(channel.url.as_str(), "wss://host/websocket?token=abc");
        assert_eq!(*channel.connects.lock(), 1);
        assert!(h.actor.attempt.is_some());
        assert_eq!(h.actor.generation, 1);
    }

    #[tokio::test]
    async fn test_second_start_fails_without_touching_first_call() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;

        let result = h.start_with(Some("other"), None).await;

        assert_eq!(result, Err(CallError::AlreadyActive));
        assert_eq!(h.channels.created.lock().len(), 1);
        assert_eq!(h.adapters.created.lock().len(), 1);
        assert_eq!(*h.channel().connects.lock(), 1);
        assert_eq!(h.actor.generation, 1);
        assert_eq!(h.actor.signaling, SignalingState::Connected);
    }

    #[tokio::test]
    async fn test_missing_token_is_a_configuration_error() {
        let mut h = Harness::new();

        assert_eq!(
            h.start_with(None, None).await,
            Err(CallError::Configuration(ConfigurationError::MissingToken))
        );
        assert_eq!(
            h.start_with(Some(""), None).await,
            Err(CallError::Configuration(ConfigurationError::MissingToken))
        );
        assert!(h.channels.created.lock().is_empty());
        assert!(h.actor.attempt.is_none());
    }

    #[tokio::test]
    async fn test_token_is_remembered_between_calls() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.command(Command::Disconnect).await;

        h.start_with(None, None).await.unwrap();
        assert_eq!(
            h.channel().url.as_str(),
            "wss://host/websocket?token=abc"
        );
    }

    #[tokio::test]
    async fn test_media_failure_starts_nothing() {
        let mut h = Harness::with_adapters(MockAdapterFactory::failing());

        let result = h.start().await;

        assert!(matches!(result, Err(CallError::Media(_))));
        assert!(h.actor.attempt.is_none());
        assert_eq!(h.actor.generation, 0);
        assert_eq!(*h.channel().connects.lock(), 0);
    }

    #[tokio::test]
    async fn test_repeated_connected_sends_one_offer() {
        let mut h = Harness::new();
        h.start_with(Some("abc"), Some(CallSettings::default().with_auth_zone(true)))
            .await
            .unwrap();

        for _ in 0..3 {
            h.connect_signaling().await;
        }

        assert_eq!(h.adapter().count(&AdapterCall::CreateOffer), 1);
        assert_eq!(
            h.calls_on_channel(),
            vec![Message::Call {
                sdp: SessionDescription::offer("mock-offer"),
                auth_zone: true,
            }]
        );
    }

    #[tokio::test]
    async fn test_new_generation_sends_a_new_offer() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;
        h.command(Command::Disconnect).await;

        h.start().await.unwrap();
        h.connect_signaling().await;

        assert_eq!(h.adapter().count(&AdapterCall::CreateOffer), 1);
        assert_eq!(h.calls_on_channel().len(), 1);
    }

    #[tokio::test]
    async fn test_offer_completing_after_dispose_is_discarded() {
        let mut h = Harness::new();
        h.start().await.unwrap();

        // Connected is handled, but the offer task has not reported back yet
        h.channel().set_state(SignalingState::Connected);
        settle().await;
        let item = h.inbox.try_recv().unwrap();
        h.actor.handle(item).await;
        h.actor.handle(Inbox::Command(Command::Disconnect)).await;
        h.pump().await;

        assert_eq!(h.adapter().count(&AdapterCall::CreateOffer), 1);
        assert!(h.calls_on_channel().is_empty());
    }

    #[tokio::test]
    async fn test_candidates_before_answer_are_buffered() {
        for _ in 0..2 {
            let mut h = Harness::new();
            h.start().await.unwrap();
            h.connect_signaling().await;

            h.deliver(Message::Candidate(candidate("c1"))).await;
            h.deliver(Message::Candidate(candidate("c2"))).await;
            assert_eq!(h.adapter().count(&AdapterCall::AddRemoteCandidate("c1".into())), 0);

            h.deliver(Message::Answer {
                sdp: "answer".to_string(),
            })
            .await;
            h.deliver(Message::Candidate(candidate("c3"))).await;

            let remote: Vec<AdapterCall> = h
                .adapter()
                .calls()
                .into_iter()
                .filter(|c| {
                    matches!(
                        c,
                        AdapterCall::SetRemoteDescription(_) | AdapterCall::AddRemoteCandidate(_)
                    )
                })
                .collect();
            assert_eq!(
                remote,
                vec![
                    AdapterCall::SetRemoteDescription("answer".into()),
                    AdapterCall::AddRemoteCandidate("c1".into()),
                    AdapterCall::AddRemoteCandidate("c2".into()),
                    AdapterCall::AddRemoteCandidate("c3".into()),
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_local_candidates_are_sent() {
        let mut h = Harness::new();
        h.start().await.unwrap();

        h.adapter()
            .emit(AdapterEvent::LocalCandidate(candidate("local")));
        h.pump().await;

        assert_eq!(
            h.calls_on_channel(),
            vec![Message::Candidate(candidate("local"))]
        );
    }

    #[tokio::test]
    async fn test_end_call_disposes_after_hangup_send() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;
        *h.channel().hold_receipts.lock() = true;

        h.command(Command::EndCall).await;
        assert!(h.actor.attempt.is_some(), "disposal waits for the send");
        assert_eq!(h.calls_on_channel().last(), Some(&Message::Hangup));

        let held: Vec<_> = h.channel().held.lock().drain(..).collect();
        for done in held {
            let _ = done.send(Ok(()));
        }
        h.pump().await;

        assert!(h.actor.attempt.is_none());
        assert_eq!(h.actor.signaling, SignalingState::Disconnected);
        assert_eq!(h.adapter().count(&AdapterCall::Close), 1);
    }

    #[tokio::test]
    async fn test_end_call_disposes_even_when_send_fails() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;
        *h.channel().send_result.lock() =
            Err(TransportError::ConnectionFailed("unreachable".to_string()));

        h.command(Command::EndCall).await;

        assert!(h.actor.attempt.is_none());
        assert_eq!(h.actor.signaling, SignalingState::Disconnected);
        assert_eq!(h.actor.peer, PeerConnectionLifecycle::Closed);
        assert_eq!(h.adapter().lifecycle(), PeerConnectionLifecycle::Closed);
        assert_eq!(*h.channel().disconnects.lock(), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let mut h = Harness::new();
        h.start().await.unwrap();

        h.command(Command::Disconnect).await;
        let generation = h.actor.generation;
        h.command(Command::Disconnect).await;

        assert_eq!(h.actor.generation, generation);
        assert_eq!(*h.channel().disconnects.lock(), 1);
        assert_eq!(h.adapter().count(&AdapterCall::Close), 1);
    }

    #[tokio::test]
    async fn test_settings_are_applied_once_on_connected() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;

        h.command(Command::SetMicrophone(true)).await;
        h.command(Command::SetSpeakerphone(true)).await;
        h.peer(PeerConnectionLifecycle::Connecting).await;
        assert!(audio_calls(&h.adapter()).is_empty());

        h.peer(PeerConnectionLifecycle::Connected).await;
        h.peer(PeerConnectionLifecycle::Connected).await;

        assert_eq!(
            audio_calls(&h.adapter()),
            vec![
                AdapterCall::LocalAudio(true),
                AdapterCall::Speaker(true),
                AdapterCall::RemoteAudio(true),
            ]
        );
    }

    #[tokio::test]
    async fn test_settings_forwarded_immediately_once_connected() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.peer(PeerConnectionLifecycle::Connected).await;
        let before = audio_calls(&h.adapter()).len();

        h.command(Command::SetMicrophone(false)).await;
        h.command(Command::SetAudioOutput(false)).await;

        let calls = audio_calls(&h.adapter());
        assert_eq!(
            &calls[before..],
            &[AdapterCall::LocalAudio(false), AdapterCall::RemoteAudio(false)]
        );
        assert!(!h.actor.settings.mic_enabled);
    }

    #[tokio::test]
    async fn test_remote_hangup_disposes_and_later_calls_are_ignored() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;
        let sent_before = h.calls_on_channel().len();

        h.deliver(Message::Hangup).await;
        assert!(h.actor.attempt.is_none());

        let adapter_calls = h.adapter().calls().len();
        h.command(Command::SetMicrophone(true)).await;
        h.command(Command::SendDigit("1".to_string())).await;
        h.command(Command::EndCall).await;

        assert_eq!(h.calls_on_channel().len(), sent_before);
        assert_eq!(h.adapter().calls().len(), adapter_calls);
        assert!(h.actor.settings.mic_enabled);
    }

    #[tokio::test]
    async fn test_send_digit_forwards_dtmf() {
        let mut h = Harness::new();
        h.start().await.unwrap();

        h.command(Command::SendDigit("#".to_string())).await;

        assert_eq!(
            h.calls_on_channel(),
            vec![Message::Dtmf {
                digit: "#".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_signaling_loss_ends_the_call() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;

        h.channel().set_state(SignalingState::Disconnected);
        h.pump().await;

        assert!(h.actor.attempt.is_none());
        assert_eq!(h.adapter().count(&AdapterCall::Close), 1);
        assert!(!h.calls_on_channel().contains(&Message::Hangup));
    }

    #[tokio::test]
    async fn test_peer_failure_notifies_without_hangup() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;

        h.peer(PeerConnectionLifecycle::Failed).await;

        assert!(h.actor.attempt.is_some());
        assert!(!h.calls_on_channel().contains(&Message::Hangup));
        assert!(h
            .observer
            .seen()
            .contains(&Observed::Peer(PeerConnectionLifecycle::Failed)));
    }

    #[tokio::test]
    async fn test_failed_peer_connection_is_not_revived() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.peer(PeerConnectionLifecycle::Failed).await;

        h.peer(PeerConnectionLifecycle::Connected).await;

        assert_eq!(h.actor.peer, PeerConnectionLifecycle::Failed);
        assert!(audio_calls(&h.adapter()).is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_every_transition() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        h.connect_signaling().await;
        h.peer(PeerConnectionLifecycle::Connecting).await;
        h.adapter().emit(AdapterEvent::RemoteStreamAdded {
            stream_id: "stream".to_string(),
        });
        h.pump().await;
        h.peer(PeerConnectionLifecycle::Connected).await;
        h.command(Command::Disconnect).await;

        assert_eq!(
            h.observer.seen(),
            vec![
                Observed::Signaling(SignalingState::Connected),
                Observed::Peer(PeerConnectionLifecycle::Connecting),
                Observed::Stream("stream".to_string()),
                Observed::Peer(PeerConnectionLifecycle::Connected),
                Observed::Signaling(SignalingState::Disconnected),
                Observed::Peer(PeerConnectionLifecycle::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_events_from_disposed_attempt_are_ignored() {
        let mut h = Harness::new();
        h.start().await.unwrap();
        let old_generation = h.actor.generation;
        h.command(Command::Disconnect).await;
        h.start().await.unwrap();

        h.actor
            .handle(Inbox::Channel {
                generation: old_generation,
                event: ChannelEvent::Message(Message::Hangup),
            })
            .await;

        assert!(h.actor.attempt.is_some());
    }

    #[tokio::test]
    async fn test_public_handle_round_trip() {
        let channels = Arc::new(MockChannelFactory::default());
        let adapters = Arc::new(MockAdapterFactory::default());
        let observer = Arc::new(RecordingObserver::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        *observer.notify.lock() = Some(tx);

        let session = CallSession::with_factories(
            CallConfig::new("https://host"),
            &observer,
            channels.clone(),
            adapters.clone(),
        );

        session
            .start_call(Some("abc".to_string()), None)
            .await
            .unwrap();
        assert!(session.is_active());

        channels.last().set_state(SignalingState::Connected);
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(seen, Some(Observed::Signaling(SignalingState::Connected)));

        session.end_call();
        loop {
            let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap();
            if seen == Some(Observed::Peer(PeerConnectionLifecycle::Closed)) {
                break;
            }
        }

        assert_eq!(session.signaling_state(), SignalingState::Disconnected);
        assert!(!session.is_active());
        assert_eq!(
            session.start_call(None, None).await.map(|_| session.is_active()),
            Ok(true)
        );
    }

    #[tokio::test]
    async fn test_end_call_completes_when_handshake_stalls() {
        use crate::signaling::{TransportStrategy, WebSocketChannelFactory};
        use tokio::net::TcpListener;

        // Accepts TCP but never answers the WebSocket handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let observer = Arc::new(RecordingObserver::default());
        let session = CallSession::with_factories(
            CallConfig::new(format!("http://{}", addr)),
            &observer,
            Arc::new(WebSocketChannelFactory::new(
                TransportStrategy::Fallback,
                Duration::from_millis(200),
            )),
            Arc::new(MockAdapterFactory::default()),
        );

        session
            .start_call(Some("abc".to_string()), None)
            .await
            .unwrap();
        session.end_call();

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.is_active() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("call was not disposed");

        assert_eq!(session.signaling_state(), SignalingState::Disconnected);
        assert_eq!(
            session.peer_connection_state(),
            PeerConnectionLifecycle::Closed
        );
        server.abort();
    }
}
