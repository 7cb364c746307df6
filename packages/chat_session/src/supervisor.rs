//! Connection supervisor: owns the WebSocket, drives the username handshake,
//! and reconnects with backoff when the link drops unexpectedly.
//!
//! Lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Connected
//!                    ^                             |
//!                    |                        (link lost)
//!                    +------- Reconnecting <-------+
//! any live state -> Disconnecting -> Disconnected   (user stop)
//! ```
//!
//! Every transition is pushed to the [`SupervisorSink`]; nothing polls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectPolicy;
use crate::endpoint::Endpoint;
use crate::error::ChatError;
use crate::protocol::{self, ChatEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const CLOSE_REASON: &str = "user disconnected";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnecting,
    /// Waiting `delay` before reconnection attempt `attempt` (1-based).
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    /// Whether the link can carry user traffic right now.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Handshaking => f.write_str("handshaking"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnecting => f.write_str("disconnecting"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt} in {delay:?})")
            }
        }
    }
}

/// Why a transition happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateCause {
    /// `connect` or `disconnect` was called.
    Requested,
    /// Socket opened and the username announce went out.
    TransportOpened,
    /// First inbound event arrived. `resumed` is true after a reconnect.
    HandshakeCompleted { resumed: bool },
    ConnectFailed(String),
    ConnectionLost(String),
    RetryStarted { attempt: u32 },
    RetryFailed(String),
    GaveUp { attempts: u32 },
}

/// Everything the supervisor reports upward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged {
        state: ConnectionState,
        cause: StateCause,
    },
    Received(ChatEvent),
}

/// Consumer of supervisor notifications.
///
/// `notify` may be called while the supervisor holds its state lock, so
/// implementations must not call back into the supervisor.
pub trait SupervisorSink: Send + Sync + 'static {
    fn notify(&self, event: SupervisorEvent);
}

#[derive(Clone, Debug)]
struct Target {
    endpoint: Endpoint,
    username: String,
}

struct Slot {
    state: ConnectionState,
    target: Option<Target>,
    /// Write half of the live link. The async mutex is the send critical
    /// section: whole frames only, one writer at a time.
    writer: Option<Arc<tokio::sync::Mutex<WsSink>>>,
    /// Scoped to one connect..disconnect session; cancelling it stops the
    /// receive loop and any pending reconnect timer.
    cancel: CancellationToken,
    /// Reconnection attempts started since the last completed handshake.
    retries: u32,
}

struct Shared {
    slot: Mutex<Slot>,
    sink: Arc<dyn SupervisorSink>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
}

/// Owns the transport connection for one chat session at a time.
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        sink: Arc<dyn SupervisorSink>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    target: None,
                    writer: None,
                    cancel: CancellationToken::new(),
                    retries: 0,
                }),
                sink,
                policy,
                connect_timeout,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.slot.lock().state.clone()
    }

    /// Open the link and announce `username`.
    ///
    /// Returns once the announce is written; the handshake completes
    /// asynchronously when the first inbound event arrives.
    pub async fn connect(&self, endpoint: Endpoint, username: &str) -> Result<(), ChatError> {
        let target = Target {
            endpoint,
            username: username.to_string(),
        };

        let cancel = {
            let mut slot = self.shared.slot.lock();
            if slot.state != ConnectionState::Disconnected {
                return Err(ChatError::AlreadyStarted);
            }
            slot.cancel = CancellationToken::new();
            slot.retries = 0;
            slot.target = Some(target.clone());
            self.shared
                .set_state(&mut slot, ConnectionState::Connecting, StateCause::Requested);
            slot.cancel.clone()
        };

        info!(endpoint = %target.endpoint, username = %target.username, "connecting to chat server");

        match open_link(&target, self.shared.connect_timeout).await {
            Ok((sink, source)) => match Shared::install(&self.shared, sink, source, &cancel, false) {
                Ok(()) => Ok(()),
                Err(sink) => {
                    close_quietly(sink).await;
                    Err(ChatError::Cancelled)
                }
            },
            Err(e) => {
                let mut slot = self.shared.slot.lock();
                if cancel.is_cancelled() {
                    return Err(ChatError::Cancelled);
                }
                warn!(endpoint = %target.endpoint, error = %e, "connect failed");
                slot.target = None;
                self.shared.set_state(
                    &mut slot,
                    ConnectionState::Disconnected,
                    StateCause::ConnectFailed(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Encode and transmit one event. Only valid while `Connected`.
    pub async fn send(&self, event: &ChatEvent) -> Result<(), ChatError> {
        let writer = {
            let slot = self.shared.slot.lock();
            match &slot.writer {
                Some(writer) if slot.state.is_connected() => writer.clone(),
                _ => return Err(ChatError::NotConnected),
            }
        };

        let frame = protocol::encode(event)?;
        let mut sink = writer.lock().await;
        sink.send(Message::Text(frame.into())).await.map_err(|e| {
            warn!(kind = event.kind(), error = %e, "send failed");
            ChatError::Transport(e.to_string())
        })?;
        debug!(kind = event.kind(), "frame sent");
        Ok(())
    }

    /// Close the link with a normal-closure frame and stop reconnecting.
    pub async fn disconnect(&self) -> Result<(), ChatError> {
        let writer = {
            let mut slot = self.shared.slot.lock();
            if matches!(
                slot.state,
                ConnectionState::Disconnected | ConnectionState::Disconnecting
            ) {
                return Err(ChatError::NotConnected);
            }
            slot.cancel.cancel();
            self.shared.set_state(
                &mut slot,
                ConnectionState::Disconnecting,
                StateCause::Requested,
            );
            slot.writer.take()
        };

        if let Some(writer) = writer {
            let mut sink = writer.lock().await;
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: CLOSE_REASON.to_string().into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!(error = %e, "close frame not delivered");
            }
            let _ = sink.close().await;
        }

        let mut slot = self.shared.slot.lock();
        slot.target = None;
        self.shared.set_state(
            &mut slot,
            ConnectionState::Disconnected,
            StateCause::Requested,
        );
        info!("disconnected from chat server");
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Background tasks hold their own Arc<Shared>; stop them with us.
        self.shared.slot.lock().cancel.cancel();
    }
}

impl Shared {
    fn set_state(&self, slot: &mut Slot, state: ConnectionState, cause: StateCause) {
        debug!(from = %slot.state, to = %state, cause = ?cause, "connection state changed");
        slot.state = state.clone();
        self.sink.notify(SupervisorEvent::StateChanged { state, cause });
    }

    /// Adopt a freshly opened link and start its receive loop. Hands the
    /// write half back if the session was cancelled meanwhile.
    fn install(
        shared: &Arc<Shared>,
        sink: WsSink,
        source: WsSource,
        cancel: &CancellationToken,
        resumed: bool,
    ) -> Result<(), WsSink> {
        let mut slot = shared.slot.lock();
        if cancel.is_cancelled() {
            return Err(sink);
        }
        slot.writer = Some(Arc::new(tokio::sync::Mutex::new(sink)));
        shared.set_state(
            &mut slot,
            ConnectionState::Handshaking,
            StateCause::TransportOpened,
        );
        tokio::spawn(receive_loop(shared.clone(), source, cancel.clone(), resumed));
        Ok(())
    }

    fn deliver(&self, frame: &[u8], cancel: &CancellationToken, resumed: bool) {
        let event = match protocol::decode(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "discarding undecodable frame");
                return;
            }
        };

        {
            let mut slot = self.slot.lock();
            if cancel.is_cancelled() {
                return;
            }
            if slot.state == ConnectionState::Handshaking {
                slot.retries = 0;
                self.set_state(
                    &mut slot,
                    ConnectionState::Connected,
                    StateCause::HandshakeCompleted { resumed },
                );
            }
        }

        debug!(kind = event.kind(), "frame received");
        self.sink.notify(SupervisorEvent::Received(event));
    }
}

/// Open the socket and send the username announce.
async fn open_link(target: &Target, connect_timeout: Duration) -> Result<(WsSink, WsSource), ChatError> {
    let connect = tokio_tungstenite::connect_async(target.endpoint.as_str());
    let (ws, _response) = tokio::time::timeout(connect_timeout, connect)
        .await
        .map_err(|_| ChatError::Connect(format!("timed out after {connect_timeout:?}")))?
        .map_err(|e| ChatError::Connect(e.to_string()))?;

    let (mut sink, source) = ws.split();
    let announce = protocol::encode(&ChatEvent::UsernameAnnounce {
        username: target.username.clone(),
    })?;
    sink.send(Message::Text(announce.into()))
        .await
        .map_err(|e| ChatError::Connect(format!("username announce failed: {e}")))?;
    Ok((sink, source))
}

async fn close_quietly(mut sink: WsSink) {
    let _ = sink.close().await;
}

/// Read frames in arrival order until the link ends or the session is cancelled.
async fn receive_loop(
    shared: Arc<Shared>,
    mut source: WsSource,
    cancel: CancellationToken,
    resumed: bool,
) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = source.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => shared.deliver(text.as_bytes(), &cancel, resumed),
            Some(Ok(Message::Binary(data))) => shared.deliver(&data, &cancel, resumed),
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!("server closed the connection ({})", u16::from(frame.code)),
                    None => "server closed the connection".to_string(),
                };
            }
            // Ping/pong are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "connection ended".to_string(),
        }
    };

    connection_lost(shared, cancel, reason).await;
}

async fn connection_lost(shared: Arc<Shared>, cancel: CancellationToken, reason: String) {
    let resume = {
        let mut slot = shared.slot.lock();
        if cancel.is_cancelled() {
            return;
        }
        slot.writer = None;

        // A link that dropped before its handshake completed counts as a
        // failed attempt, so the cap still applies.
        let failed = slot.retries;
        if failed > 0 && shared.policy.exhausted(failed) {
            warn!(attempts = failed, reason = %reason, "connection lost during retry, giving up");
            slot.target = None;
            shared.set_state(
                &mut slot,
                ConnectionState::Disconnected,
                StateCause::GaveUp { attempts: failed },
            );
            return;
        }

        let attempt = failed + 1;
        warn!(reason = %reason, attempt, "connection lost, will attempt reconnection");
        let delay = shared.policy.delay_for(attempt);
        shared.set_state(
            &mut slot,
            ConnectionState::Reconnecting { attempt, delay },
            StateCause::ConnectionLost(reason),
        );
        slot.target.clone().map(|target| (target, attempt))
    };

    if let Some((target, attempt)) = resume {
        reconnect_loop(&shared, &cancel, &target, attempt).await;
    }
}

async fn reconnect_loop(
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    target: &Target,
    mut attempt: u32,
) {
    loop {
        let delay = shared.policy.delay_for(attempt);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let mut slot = shared.slot.lock();
            if cancel.is_cancelled() {
                return;
            }
            slot.retries = attempt;
            shared.set_state(
                &mut slot,
                ConnectionState::Connecting,
                StateCause::RetryStarted { attempt },
            );
        }
        info!(endpoint = %target.endpoint, attempt, "reconnection attempt");

        match open_link(target, shared.connect_timeout).await {
            Ok((sink, source)) => {
                if let Err(sink) = Shared::install(shared, sink, source, cancel, true) {
                    close_quietly(sink).await;
                }
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect failed");
                let mut slot = shared.slot.lock();
                if cancel.is_cancelled() {
                    return;
                }
                if shared.policy.exhausted(attempt) {
                    warn!(attempts = attempt, "giving up on reconnection");
                    slot.target = None;
                    shared.set_state(
                        &mut slot,
                        ConnectionState::Disconnected,
                        StateCause::GaveUp { attempts: attempt },
                    );
                    return;
                }
                attempt += 1;
                let delay = shared.policy.delay_for(attempt);
                shared.set_state(
                    &mut slot,
                    ConnectionState::Reconnecting { attempt, delay },
                    StateCause::RetryFailed(e.to_string()),
                );
            }
        }
    }
}
