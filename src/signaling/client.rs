//! WebSocket client for the signaling server
//!
//! A single driver task owns the socket:
//! - Commands (connect, disconnect, send) are handled strictly in order
//! - Sends on a dead socket reconnect first
//! - Inbound text frames are decoded and forwarded as events
//! - Optional keepalive pings
//! - Dials give up after a fixed timeout, so a send never waits forever

use super::channel::{
    ChannelEvent, ChannelFactory, SendReceipt, SignalingChannel, SignalingState, TransportError,
};
use super::messages::Message;
use super::transport::TransportStrategy;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// DRIVER COMMANDS
// ============================================================================

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send {
        event: &'static str,
        text: String,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
}

// ============================================================================
// WEBSOCKET CHANNEL
// ============================================================================

/// [`SignalingChannel`] backed by `tokio-tungstenite`
pub struct WebSocketChannel {
    url: Url,
    state: Arc<RwLock<SignalingState>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl WebSocketChannel {
    /// Spawns the driver task. Nothing is dialed until [`connect`] or the
    /// first send. A dial that has not completed the handshake within
    /// `connect_timeout` fails.
    ///
    /// [`connect`]: SignalingChannel::connect
    pub fn open(
        url: Url,
        strategy: TransportStrategy,
        connect_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(SignalingState::Idle));

        let driver = Driver {
            url: url.clone(),
            keepalive: strategy.keepalive(),
            connect_timeout,
            socket: None,
            state: Arc::clone(&state),
            event_tx,
        };
        tokio::spawn(driver.run(commands_rx));

        let channel = Self {
            url,
            state,
            commands: commands_tx,
        };
        (channel, event_rx)
    }
}

impl SignalingChannel for WebSocketChannel {
    fn state(&self) -> SignalingState {
        *self.state.read()
    }

    fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    fn send(&self, message: Message) -> SendReceipt {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Signaling send failed: {}", e);
                return SendReceipt::ready(Err(TransportError::SendFailed(e.to_string())));
            }
        };

        let (done, receipt) = SendReceipt::channel();
        // A dead driver drops `done`, which resolves the receipt as closed
        let _ = self.commands.send(Command::Send {
            event: message.event(),
            text,
            done,
        });
        receipt
    }
}

impl std::fmt::Debug for WebSocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketChannel")
            .field("url", &self.url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// DRIVER
// ============================================================================

struct Driver {
    url: Url,
    keepalive: Option<Duration>,
    connect_timeout: Duration,
    socket: Option<WsStream>,
    state: Arc<RwLock<SignalingState>>,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut keepalive =
            tokio::time::interval(self.keepalive.unwrap_or(Duration::from_secs(3600)));
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                frame = next_frame(&mut self.socket), if self.socket.is_some() => {
                    self.handle_frame(frame);
                }
                _ = keepalive.tick(), if self.keepalive.is_some() && self.socket.is_some() => {
                    self.ping().await;
                }
            }
        }

        // Every handle is gone; nobody is listening for the final state
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        tracing::debug!("Signaling driver for {} stopped", self.url);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.socket.is_none() {
                    if let Err(e) = self.dial().await {
                        tracing::error!("{}", e);
                        self.set_state(SignalingState::Disconnected);
                    }
                }
            }

            Command::Disconnect => {
                if let Some(mut socket) = self.socket.take() {
                    let _ = socket.close(None).await;
                }
                self.set_state(SignalingState::Disconnected);
            }

            Command::Send { event, text, done } => {
                let result = self.write(event, text).await;
                if let Err(e) = &result {
                    tracing::warn!("Signaling send failed: {}", e);
                }
                let _ = done.send(result);
            }
        }
    }

    async fn write(&mut self, event: &str, text: String) -> Result<(), TransportError> {
        if self.socket.is_none() {
            tracing::info!("Reconnecting before sending {}", event);
            if let Err(e) = self.dial().await {
                self.set_state(SignalingState::Disconnected);
                return Err(e);
            }
        }

        let Some(socket) = self.socket.as_mut() else {
            return Err(TransportError::Closed);
        };

        if let Err(e) = socket.send(WsMessage::Text(text)).await {
            self.socket = None;
            self.set_state(SignalingState::Disconnected);
            return Err(TransportError::SendFailed(e.to_string()));
        }

        tracing::debug!("Sent {}", event);
        Ok(())
    }

    /// Drops any stale socket and opens a fresh one.
    async fn dial(&mut self) -> Result<(), TransportError> {
        self.socket = None;
        tracing::info!("Connecting to signaling server: {}", self.url);

        let dial = connect_async(self.url.as_str());
        let (socket, _) = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        self.socket = Some(socket);
        self.set_state(SignalingState::Connected);
        Ok(())
    }

    fn handle_frame(&mut self, frame: Option<Result<WsMessage, tungstenite::Error>>) {
        match frame {
            Some(Ok(WsMessage::Text(text))) => match Message::decode(&text) {
                Ok(message) => {
                    tracing::debug!("Received {}", message.event());
                    let _ = self.event_tx.send(ChannelEvent::Message(message));
                }
                Err(e) => tracing::warn!("Dropping signaling payload: {} ({})", e, text),
            },
            Some(Ok(WsMessage::Binary(_))) => {
                tracing::debug!("Ignoring binary frame, text expected");
            }
            Some(Ok(WsMessage::Close(_))) => {
                tracing::info!("WebSocket closed by server");
                self.socket = None;
                self.set_state(SignalingState::Disconnected);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!("WebSocket error: {}", e);
                self.socket = None;
                self.set_state(SignalingState::Disconnected);
            }
            None => {
                self.socket = None;
                self.set_state(SignalingState::Disconnected);
            }
        }
    }

    async fn ping(&mut self) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };
        if let Err(e) = socket.send(WsMessage::Ping(Vec::new())).await {
            tracing::warn!("Failed to send keepalive: {}", e);
            self.socket = None;
            self.set_state(SignalingState::Disconnected);
        }
    }

    fn set_state(&self, state: SignalingState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::debug!("Signaling state: {:?}", state);
        let _ = self.event_tx.send(ChannelEvent::StateChanged(state));
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<WsMessage, tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Opens a [`WebSocketChannel`] per call attempt using a fixed strategy.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketChannelFactory {
    strategy: TransportStrategy,
    connect_timeout: Duration,
}

impl WebSocketChannelFactory {
    pub fn new(strategy: TransportStrategy, connect_timeout: Duration) -> Self {
        Self {
            strategy,
            connect_timeout,
        }
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn create(
        &self,
        url: Url,
    ) -> (
        Arc<dyn SignalingChannel>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let (channel, events) = WebSocketChannel::open(url, self.strategy, self.connect_timeout);
        (Arc::new(channel), events)
    }
}
