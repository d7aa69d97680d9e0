//! Broker connection manager: STOMP session over a WebSocket with reconnect.
//!
//! ARCHITECTURE
//! ============
//! One background task owns the socket. Callers talk to it through a cloneable
//! [`ConnectionHandle`] (commands in) and an event receiver (state changes and
//! inbound bodies out). The task is the only writer of connection state, so
//! the state machine never races:
//!
//! ```text
//! Disconnected --connect()--> Connecting --CONNECTED--> Connected
//!      ^                          |                        |
//!      |                       failure               drop / error
//!      |                          v                        v
//!      +----attempts exhausted-- Reconnecting <------------+
//! ```
//!
//! `disconnect()` from any state returns to `Disconnected` and cancels any
//! scheduled reconnect.
//!
//! LIFECYCLE
//! =========
//! 1. Open the socket, send `CONNECT`, wait for `CONNECTED`.
//! 2. Adopt the broker's `session` header, or mint a UUID when absent.
//! 3. Subscribe to the broadcast topic and the private error queue.
//! 4. Relay frames until the link drops, a broker `ERROR` arrives, or the
//!    peer misses heart-beats for two intervals.
//! 5. Back off (`base * 2^(attempt-1)`, capped) and go to 1.
//!
//! TRADE-OFFS
//! ==========
//! Sends while not connected are dropped, not queued. Queued edits replayed
//! after a reconnect would apply on top of whatever peers did meanwhile.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::stomp::{self, CodecError, Command, HEARTBEAT, StompFrame};

const TOPIC_SUBSCRIPTION: &str = "sub-0";
const ERROR_SUBSCRIPTION: &str = "sub-1";

/// Floor for the heart-beat timer period; a zero period would panic.
const MIN_TICK: Duration = Duration::from_millis(1);

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Notifications from the connection task, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    /// Handshake completed and both subscriptions are in place.
    Connected { session_id: String },
    /// Body of a broadcast topic message.
    Message(String),
    /// Body of a message on the private error queue.
    ErrorQueue(String),
    /// Reconnect attempts exhausted. The manager stays disconnected.
    GaveUp { attempts: u32, last_error: String },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("stomp framing error: {0}")]
    Codec(#[from] CodecError),
    #[error("broker error: {0}")]
    Broker(String),
    #[error("no CONNECTED frame within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("broker silent for {0:?}")]
    HeartbeatTimeout(Duration),
}

/// Opens a bidirectional text link to the broker.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(&mut self, url: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// One open link carrying text messages.
///
/// `recv` must be cancel-safe: the connection task polls it inside `select!`.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    /// Next inbound text. `None` once the link is closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self);
}

/// Reconnect delay for a 1-based attempt number: `base * 2^(attempt-1)`, capped.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

// =============================================================================
// WEBSOCKET TRANSPORT
// =============================================================================

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&mut self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let (stream, _) = connect_async(url).await.map_err(|e| TransportError::Ws(Box::new(e)))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::text(text))
            .await
            .map_err(|e| TransportError::Ws(Box::new(e)))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(TransportError::Ws(Box::new(e)))),
            };
            match msg {
                WsMessage::Text(text) => return Some(Ok(text.as_str().to_owned())),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(e) => warn!(error = %e, "ws: dropping non-utf8 binary message"),
                },
                WsMessage::Close(_) => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "ws: close handshake failed");
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Debug)]
enum ConnCommand {
    Connect,
    Disconnect,
    Send { destination: String, payload: String },
}

/// Cloneable front end of the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ConnCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Start connecting. No-op when already connecting or connected.
    pub fn connect(&self) {
        self.command(ConnCommand::Connect);
    }

    /// Close the session and cancel any pending reconnect.
    pub fn disconnect(&self) {
        self.command(ConnCommand::Disconnect);
    }

    /// Publish `payload` to `destination`. Returns `false` (and drops the
    /// payload) when not connected.
    pub fn send(&self, destination: impl Into<String>, payload: impl Into<String>) -> bool {
        let destination = destination.into();
        if self.state() != ConnectionState::Connected {
            debug!(%destination, "conn: not connected, dropping send");
            return false;
        }
        self.command(ConnCommand::Send { destination, payload: payload.into() })
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch channel that changes with every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, cmd: ConnCommand) -> bool {
        if self.commands.send(cmd).is_err() {
            warn!("conn: connection task has stopped");
            return false;
        }
        true
    }
}

/// Spawn the connection task. It stays idle until [`ConnectionHandle::connect`].
pub fn spawn<T: Transport>(
    config: ConnectionConfig,
    transport: T,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let driver = Driver { config, transport, commands: cmd_rx, events: event_tx, state: state_tx, attempt: 0 };
    tokio::spawn(driver.run());

    (ConnectionHandle { commands: cmd_tx, state: state_rx }, event_rx)
}

// =============================================================================
// DRIVER
// =============================================================================

struct Driver<T> {
    config: ConnectionConfig,
    transport: T,
    commands: mpsc::UnboundedReceiver<ConnCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    attempt: u32,
}

struct Session {
    link: Box<dyn Link>,
    session_id: String,
    /// How often the broker promised to send something, if at all.
    broker_heartbeat: Option<Duration>,
}

/// Why a connect/session cycle stopped.
enum Stop {
    /// `disconnect()` or the handle was dropped.
    Requested,
    Failed(TransportError),
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        while self.wait_for_connect().await {
            self.cycle().await;
            self.set_state(ConnectionState::Disconnected);
        }
        debug!("conn: all handles dropped, task exiting");
    }

    /// Idle until a connect command. Returns `false` when every handle is gone.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                None => return false,
                Some(ConnCommand::Connect) => {
                    self.attempt = 0;
                    return true;
                }
                Some(ConnCommand::Send { destination, .. }) => {
                    debug!(%destination, "conn: not connected, dropping send");
                }
                Some(ConnCommand::Disconnect) => {}
            }
        }
    }

    /// Connect, serve, and reconnect until asked to stop or out of attempts.
    async fn cycle(&mut self) {
        loop {
            self.set_state(if self.attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let error = match self.open_session().await {
                Ok(session) => {
                    self.attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    info!(session_id = %session.session_id, url = %self.config.url, "conn: connected");
                    self.emit(ConnectionEvent::Connected { session_id: session.session_id.clone() });
                    match self.serve(session).await {
                        Stop::Requested => return,
                        Stop::Failed(e) => e,
                    }
                }
                Err(Stop::Requested) => return,
                Err(Stop::Failed(e)) => e,
            };

            if !self.back_off(&error).await {
                return;
            }
        }
    }

    /// Handshake while still honoring disconnect commands.
    async fn open_session(&mut self) -> Result<Session, Stop> {
        let handshake = handshake(&mut self.transport, &self.config);
        tokio::pin!(handshake);
        loop {
            tokio::select! {
                result = &mut handshake => return result.map_err(Stop::Failed),
                cmd = self.commands.recv() => match cmd {
                    None | Some(ConnCommand::Disconnect) => return Err(Stop::Requested),
                    Some(ConnCommand::Send { destination, .. }) => {
                        debug!(%destination, "conn: handshake in progress, dropping send");
                    }
                    Some(ConnCommand::Connect) => {}
                },
            }
        }
    }

    /// Relay traffic for one established session.
    async fn serve(&mut self, session: Session) -> Stop {
        let Session { mut link, broker_heartbeat, .. } = session;

        let heartbeat_enabled = !self.config.heartbeat.is_zero();
        let period = if heartbeat_enabled {
            self.config.heartbeat
        } else {
            broker_heartbeat.unwrap_or(MIN_TICK)
        }
        .max(MIN_TICK);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let silence_limit = broker_heartbeat.map(|hb| hb.max(self.config.heartbeat) * 2);
        let mut last_seen = Instant::now();

        let stop = loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(ConnCommand::Disconnect) => {
                        if let Err(e) = link.send(stomp::encode(&StompFrame::disconnect())).await {
                            debug!(error = %e, "conn: DISCONNECT not delivered");
                        }
                        break Stop::Requested;
                    }
                    Some(ConnCommand::Connect) => {}
                    Some(ConnCommand::Send { destination, payload }) => {
                        let frame = StompFrame::send(&destination, payload);
                        if let Err(e) = link.send(stomp::encode(&frame)).await {
                            break Stop::Failed(e);
                        }
                    }
                },
                inbound = link.recv() => match inbound {
                    None => break Stop::Failed(TransportError::Closed),
                    Some(Err(e)) => break Stop::Failed(e),
                    Some(Ok(text)) => {
                        last_seen = Instant::now();
                        if let Err(e) = self.on_text(&text) {
                            break Stop::Failed(e);
                        }
                    }
                },
                _ = heartbeat.tick(), if heartbeat_enabled || silence_limit.is_some() => {
                    if let Some(limit) = silence_limit
                        && last_seen.elapsed() > limit
                    {
                        break Stop::Failed(TransportError::HeartbeatTimeout(limit));
                    }
                    if heartbeat_enabled
                        && let Err(e) = link.send(HEARTBEAT.to_owned()).await
                    {
                        break Stop::Failed(e);
                    }
                }
            }
        };

        link.close().await;
        stop
    }

    fn on_text(&self, text: &str) -> Result<(), TransportError> {
        let frame = match stomp::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "conn: dropping malformed frame");
                return Ok(());
            }
        };

        match frame.command {
            Command::Message => {
                let private = frame.get("subscription") == Some(ERROR_SUBSCRIPTION)
                    || frame.get("destination") == Some(self.config.error_queue.as_str());
                if private {
                    self.emit(ConnectionEvent::ErrorQueue(frame.body));
                } else {
                    self.emit(ConnectionEvent::Message(frame.body));
                }
                Ok(())
            }
            Command::Error => Err(TransportError::Broker(broker_error_text(&frame))),
            other => {
                debug!(command = %other, "conn: ignoring frame");
                Ok(())
            }
        }
    }

    /// Wait out the reconnect delay. Returns `false` when the cycle should end.
    async fn back_off(&mut self, error: &TransportError) -> bool {
        self.attempt += 1;
        if self.attempt > self.config.max_attempts {
            let attempts = self.attempt - 1;
            error!(attempts, error = %error, "conn: giving up reconnecting");
            self.emit(ConnectionEvent::GaveUp { attempts, last_error: error.to_string() });
            return false;
        }

        let delay = backoff_delay(self.attempt, self.config.reconnect_base, self.config.reconnect_max);
        self.set_state(ConnectionState::Reconnecting);
        warn!(
            error = %error,
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "conn: connection lost, scheduling reconnect"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                cmd = self.commands.recv() => match cmd {
                    None | Some(ConnCommand::Disconnect) => {
                        info!("conn: reconnect cancelled");
                        return false;
                    }
                    Some(ConnCommand::Send { destination, .. }) => {
                        debug!(%destination, "conn: reconnecting, dropping send");
                    }
                    Some(ConnCommand::Connect) => {}
                },
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(state = ?next, "conn: state changed");
            self.emit(ConnectionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            debug!("conn: event receiver dropped");
        }
    }
}

async fn handshake<T: Transport>(transport: &mut T, config: &ConnectionConfig) -> Result<Session, TransportError> {
    let mut link = transport.open(&config.url).await?;
    let heartbeat_ms = u64::try_from(config.heartbeat.as_millis()).unwrap_or(u64::MAX);
    link.send(stomp::encode(&StompFrame::connect(&config.host, heartbeat_ms))).await?;

    let connected = tokio::time::timeout(config.connect_timeout, wait_connected(link.as_mut()))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(config.connect_timeout))??;

    let session_id = connected.get("session").map_or_else(|| Uuid::new_v4().to_string(), ToOwned::to_owned);
    let broker_heartbeat = connected.get("heart-beat").and_then(broker_send_interval);

    link.send(stomp::encode(&StompFrame::subscribe(TOPIC_SUBSCRIPTION, &config.topic))).await?;
    link.send(stomp::encode(&StompFrame::subscribe(ERROR_SUBSCRIPTION, &config.error_queue))).await?;

    Ok(Session { link, session_id, broker_heartbeat })
}

async fn wait_connected(link: &mut dyn Link) -> Result<StompFrame, TransportError> {
    loop {
        let text = link.recv().await.ok_or(TransportError::Closed)??;
        let Some(frame) = stomp::decode(&text)? else {
            continue;
        };
        match frame.command {
            Command::Connected => return Ok(frame),
            Command::Error => return Err(TransportError::Broker(broker_error_text(&frame))),
            other => debug!(command = %other, "conn: ignoring frame before CONNECTED"),
        }
    }
}

/// First value of the broker's `heart-beat` header: how often it will send.
fn broker_send_interval(header: &str) -> Option<Duration> {
    let (send, _) = header.split_once(',')?;
    match send.trim().parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
    }
}

fn broker_error_text(frame: &StompFrame) -> String {
    frame.get("message").map_or_else(|| frame.body.clone(), ToOwned::to_owned)
}

impl crate::engine::Outbox for ConnectionHandle {
    fn publish(&self, destination: &str, payload: String) -> bool {
        self.send(destination, payload)
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
