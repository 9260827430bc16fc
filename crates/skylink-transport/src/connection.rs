//! [`TransportManager`] – resilient WebSocket connection to the device backend.
//!
//! The manager is a cheap, cloneable handle.  All mutable connection state
//! (the socket, the [`ConnectionState`], the [`ConnectionStats`], the outbound
//! queue and the listener table) lives inside a single Tokio task, the
//! *connection task*, which is driven by commands sent over an unbounded
//! channel.  Because every command is processed in the order it was issued,
//! frames queued while disconnected are always flushed before frames sent
//! after the reconnect, without any lock around the queue.
//!
//! # Lifecycle
//!
//! ```text
//!            connect()/initiate_connection()
//!  Closed ─────────────────────────────────► Connecting ──handshake ok──► Open
//!    ▲  ▲                                        │                         │
//!    │  └──── reconnect_interval elapsed ◄───────┴── failure / drop ◄──────┘
//!    │         (attempts < max, not explicitly closed)
//!    └──── close() / attempts exhausted
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use skylink_transport::{EventKind, TransportConfig, TransportEvent, TransportManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = TransportManager::connect(TransportConfig::new("ws://localhost:1888/ws"));
//!     transport.on(EventKind::Message, |event: &TransportEvent| {
//!         println!("inbound: {event:?}");
//!     });
//!     // Queued until the handshake completes.
//!     transport.send(&json!({ "topic": "mount/status", "data": null }));
//! }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{Value, json};
use skylink_types::{ConnectionState, ConnectionStats, LinkError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::config::TransportConfig;
use crate::events::{EventKind, Listener, ListenerId, ListenerRegistry, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Keep-alive payload sent every heartbeat interval while open.
pub fn heartbeat_payload() -> Value {
    json!({ "type": "ping" })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Requests sent from the public handle to the connection task.
enum Command {
    /// Transmit (or queue) an already-encoded frame.
    Send(Vec<u8>),
    Close,
    Connect,
    Listen {
        id: ListenerId,
        kind: EventKind,
        listener: Listener,
    },
    Unlisten(ListenerId),
    /// Surface a failure detected on the caller side as an `Error` event.
    ReportError(LinkError),
}

// ---------------------------------------------------------------------------
// TransportManager (public handle)
// ---------------------------------------------------------------------------

/// Handle to a single resilient connection.
///
/// Clone it cheaply – all clones talk to the same connection task.  The task
/// stops once every handle has been dropped.
#[derive(Clone)]
pub struct TransportManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    stats_rx: watch::Receiver<ConnectionStats>,
    codec: Arc<dyn Codec>,
}

impl TransportManager {
    /// Spawn the connection task and immediately start connecting.
    ///
    /// Must be called from within a Tokio runtime.  Listeners registered
    /// right after this call observe every event from the first handshake
    /// onwards.
    pub fn connect(config: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (stats_tx, stats_rx) = watch::channel(ConnectionStats::default());
        let codec = Arc::clone(&config.codec);

        info!(url = %config.url, "starting transport");
        let actor = ConnectionActor::new(config, cmd_rx, state_tx, stats_tx);
        tokio::spawn(actor.run(Phase::Connecting));

        Self {
            cmd_tx,
            state_rx,
            stats_rx,
            codec,
        }
    }

    /// Serialise `message` and transmit it, or queue it until the connection
    /// is open.
    ///
    /// Never fails: encoding errors are reported through an
    /// [`TransportEvent::Error`] event and the message is dropped.
    pub fn send(&self, message: &Value) {
        match self.codec.encode(message) {
            Ok(frame) => self.dispatch(Command::Send(frame)),
            Err(e) => {
                warn!(error = %e, "dropping outbound message that failed to encode");
                self.dispatch(Command::ReportError(e));
            }
        }
    }

    /// Close the connection and suppress any further automatic reconnection.
    ///
    /// Idempotent.  Use [`initiate_connection`][Self::initiate_connection] to
    /// connect again.
    pub fn close(&self) {
        self.dispatch(Command::Close);
    }

    /// Start a fresh connection attempt when the manager is closed, either
    /// after [`close`][Self::close] or after reconnection gave up.
    ///
    /// Clears the explicit-close flag and grants a new reconnection budget.
    /// No-op while connecting or open.
    pub fn initiate_connection(&self) {
        self.dispatch(Command::Connect);
    }

    /// Current connection state as last published by the connection task.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// A receiver that observes every state transition, for status
    /// indicators.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Copy of the current connection counters.
    pub fn stats(&self) -> ConnectionStats {
        self.stats_rx.borrow().clone()
    }

    /// Register `listener` for events of `kind`.
    ///
    /// Several listeners may observe the same kind; they are called in
    /// registration order on the connection task, so they must not block.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.dispatch(Command::Listen {
            id,
            kind,
            listener: Arc::new(listener),
        });
        id
    }

    /// Remove a listener previously returned by [`on`][Self::on].
    pub fn off(&self, id: ListenerId) {
        self.dispatch(Command::Unlisten(id));
    }

    fn dispatch(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("transport task has stopped; command discarded");
        }
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

/// What the connection task is currently doing.
enum Phase {
    /// Closed with no reconnection scheduled.
    Idle,
    Connecting,
    Open(Box<WsStream>),
    /// Closed, waiting for the reconnect interval to elapse.
    Backoff,
    Shutdown,
}

struct ConnectionActor {
    config: TransportConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    stats_tx: watch::Sender<ConnectionStats>,
    listeners: ListenerRegistry,
    queue: VecDeque<Vec<u8>>,
    reconnect_attempts: u32,
    explicit_close: bool,
}

impl ConnectionActor {
    fn new(
        config: TransportConfig,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        state_tx: watch::Sender<ConnectionState>,
        stats_tx: watch::Sender<ConnectionStats>,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            state_tx,
            stats_tx,
            listeners: ListenerRegistry::default(),
            queue: VecDeque::new(),
            reconnect_attempts: 0,
            explicit_close: false,
        }
    }

    async fn run(mut self, mut phase: Phase) {
        loop {
            phase = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connecting => self.connecting().await,
                Phase::Open(ws) => self.open(*ws).await,
                Phase::Backoff => self.backoff().await,
                Phase::Shutdown => break,
            };
        }
        debug!(url = %self.config.url, "transport task stopped");
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn idle(&mut self) -> Phase {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                return Phase::Shutdown;
            };
            match self.apply(cmd) {
                Some(Command::Send(frame)) => self.enqueue(frame),
                Some(Command::Close) => self.explicit_close = true,
                Some(Command::Connect) => {
                    self.rearm();
                    return Phase::Connecting;
                }
                _ => {}
            }
        }
    }

    async fn connecting(&mut self) -> Phase {
        self.set_state(ConnectionState::Connecting);
        let handshake = establish(self.config.url.clone(), self.config.connect_timeout);
        tokio::pin!(handshake);

        loop {
            tokio::select! {
                // Commands first so listeners registered before the handshake
                // completes see the `Open` event.
                biased;

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Phase::Shutdown };
                    match self.apply(cmd) {
                        Some(Command::Send(frame)) => self.enqueue(frame),
                        Some(Command::Close) => {
                            self.explicit_close = true;
                            info!(url = %self.config.url, "handshake aborted by close()");
                            self.on_closed();
                            return Phase::Idle;
                        }
                        _ => {}
                    }
                }
                result = &mut handshake => {
                    return match result {
                        Ok(ws) => {
                            self.on_open();
                            Phase::Open(Box::new(ws))
                        }
                        Err(e) => self.on_failure(e),
                    };
                }
            }
        }
    }

    async fn open(&mut self, mut ws: WsStream) -> Phase {
        if let Err(e) = self.flush(&mut ws).await {
            return self.on_failure(e);
        }

        let interval = self.config.heartbeat_interval;
        // A zero interval disables the heartbeat.
        let heartbeat_enabled = !interval.is_zero();
        let heartbeat = tokio::time::sleep(interval);
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        if let Err(e) = ws.close(None).await {
                            debug!(error = %e, "close frame could not be sent");
                        }
                        return Phase::Shutdown;
                    };
                    match self.apply(cmd) {
                        Some(Command::Send(frame)) => {
                            if let Err(e) = self.transmit(&mut ws, frame).await {
                                return self.on_failure(e);
                            }
                        }
                        Some(Command::Close) => {
                            self.explicit_close = true;
                            self.set_state(ConnectionState::Closing);
                            if let Err(e) = ws.close(None).await {
                                debug!(error = %e, "close frame could not be sent");
                            }
                            info!(url = %self.config.url, "connection closed by client");
                            self.on_closed();
                            return Phase::Idle;
                        }
                        _ => {}
                    }
                }
                frame = ws.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            // Any inbound traffic counts as liveness.
                            heartbeat.as_mut().reset(Instant::now() + interval);
                            match msg {
                                Message::Text(text) => self.receive(text.as_str().as_bytes()),
                                Message::Binary(bytes) => self.receive(&bytes),
                                Message::Close(reason) => {
                                    info!(url = %self.config.url, reason = ?reason, "connection closed by server");
                                    // Flushes the close reply tungstenite queued.
                                    if let Err(e) = ws.close(None).await {
                                        debug!(error = %e, "close reply could not be sent");
                                    }
                                    self.on_closed();
                                    return self.schedule_reconnect();
                                }
                                _ => {}
                            }
                        }
                        Some(Err(e)) => {
                            return self.on_failure(LinkError::Transport(e.to_string()));
                        }
                        None => {
                            info!(url = %self.config.url, "connection stream ended");
                            self.on_closed();
                            return self.schedule_reconnect();
                        }
                    }
                }
                () = &mut heartbeat, if heartbeat_enabled => {
                    heartbeat.as_mut().reset(Instant::now() + interval);
                    match self.config.codec.encode(&heartbeat_payload()) {
                        Ok(frame) => {
                            if let Err(e) = self.transmit(&mut ws, frame).await {
                                return self.on_failure(e);
                            }
                        }
                        Err(e) => self.emit(TransportEvent::Error(e)),
                    }
                }
            }
        }
    }

    async fn backoff(&mut self) -> Phase {
        let delay = tokio::time::sleep(self.config.reconnect_interval);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return Phase::Shutdown };
                    match self.apply(cmd) {
                        Some(Command::Send(frame)) => self.enqueue(frame),
                        Some(Command::Close) => {
                            self.explicit_close = true;
                            debug!("pending reconnection cancelled by close()");
                            return Phase::Idle;
                        }
                        Some(Command::Connect) => {
                            self.rearm();
                            return Phase::Connecting;
                        }
                        _ => {}
                    }
                }
                () = &mut delay => {
                    self.reconnect_attempts += 1;
                    info!(
                        url = %self.config.url,
                        attempt = self.reconnect_attempts,
                        max = self.config.max_reconnect_attempts,
                        "reconnecting"
                    );
                    self.emit(TransportEvent::Reconnect(self.reconnect_attempts));
                    return Phase::Connecting;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn on_open(&mut self) {
        self.reconnect_attempts = 0;
        self.stats_tx.send_modify(|stats| {
            stats.connection_attempts += 1;
            stats.last_connected_at = Some(Utc::now());
        });
        info!(url = %self.config.url, queued = self.queue.len(), "connection open");
        self.state_tx.send_replace(ConnectionState::Open);
        self.emit(TransportEvent::Open);
        self.emit(TransportEvent::StateChange(ConnectionState::Open));
    }

    /// Shared tail of every way a connection can end.
    fn on_closed(&mut self) {
        self.stats_tx.send_modify(|stats| {
            stats.last_disconnected_at = Some(Utc::now());
        });
        self.state_tx.send_replace(ConnectionState::Closed);
        self.emit(TransportEvent::Close);
        self.emit(TransportEvent::StateChange(ConnectionState::Closed));
    }

    fn on_failure(&mut self, error: LinkError) -> Phase {
        warn!(url = %self.config.url, error = %error, "connection failed");
        self.emit(TransportEvent::Error(error));
        self.on_closed();
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&self) -> Phase {
        if self.explicit_close {
            Phase::Idle
        } else if self.reconnect_attempts < self.config.max_reconnect_attempts {
            debug!(
                delay_ms = self.config.reconnect_interval.as_millis() as u64,
                "scheduling reconnection"
            );
            Phase::Backoff
        } else {
            warn!(
                url = %self.config.url,
                attempts = self.reconnect_attempts,
                "reconnection attempts exhausted; staying closed until initiate_connection()"
            );
            Phase::Idle
        }
    }

    fn rearm(&mut self) {
        self.explicit_close = false;
        self.reconnect_attempts = 0;
    }

    fn set_state(&mut self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            self.emit(TransportEvent::StateChange(state));
        }
    }

    // -----------------------------------------------------------------------
    // Commands and frames
    // -----------------------------------------------------------------------

    /// Handle the commands whose effect does not depend on the phase; hand
    /// the others back to the caller.
    fn apply(&mut self, cmd: Command) -> Option<Command> {
        match cmd {
            Command::Listen { id, kind, listener } => {
                self.listeners.add(id, kind, listener);
                None
            }
            Command::Unlisten(id) => {
                if !self.listeners.remove(id) {
                    debug!(?id, "off() for unknown listener");
                }
                None
            }
            Command::ReportError(e) => {
                self.emit(TransportEvent::Error(e));
                None
            }
            other => Some(other),
        }
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        if let Some(max) = self.config.max_queue_len {
            let evicted = if max == 0 {
                true
            } else if self.queue.len() >= max {
                self.queue.pop_front();
                self.queue.push_back(frame);
                true
            } else {
                self.queue.push_back(frame);
                false
            };
            if evicted {
                warn!(max_queue_len = max, "outbound queue full; oldest frame dropped");
                self.stats_tx.send_modify(|stats| stats.dropped_messages += 1);
            }
        } else {
            self.queue.push_back(frame);
        }
        self.sync_queue_len();
    }

    /// Drain the outbound queue in FIFO order.  On failure the unsent frame
    /// is put back at the front so order survives the next reconnect.
    async fn flush<S>(&mut self, ws: &mut S) -> Result<(), LinkError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let pending = self.queue.len();
        while let Some(frame) = self.queue.pop_front() {
            self.transmit(ws, frame).await?;
        }
        if pending > 0 {
            debug!(flushed = pending, "outbound queue flushed");
        }
        self.sync_queue_len();
        Ok(())
    }

    async fn transmit<S>(&mut self, ws: &mut S, frame: Vec<u8>) -> Result<(), LinkError>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        let len = frame.len();
        match ws.send(self.frame_message(frame.clone())).await {
            Ok(()) => {
                if self.config.debug {
                    debug!(bytes = len, "frame sent");
                }
                self.stats_tx.send_modify(|stats| stats.messages_sent += 1);
                Ok(())
            }
            Err(e) => {
                self.queue.push_front(frame);
                self.sync_queue_len();
                Err(LinkError::Transport(format!("send failed: {e}")))
            }
        }
    }

    fn frame_message(&self, frame: Vec<u8>) -> Message {
        if self.config.binary {
            return Message::Binary(frame.into());
        }
        match String::from_utf8(frame) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.stats_tx.send_modify(|stats| stats.messages_received += 1);
        if self.config.debug {
            debug!(bytes = bytes.len(), "frame received");
        }
        match self.config.codec.decode(bytes) {
            Ok(value) => self.emit(TransportEvent::Message(value)),
            // Text the codec cannot read is passed on as a plain string.
            Err(e) => match std::str::from_utf8(bytes) {
                Ok(text) => {
                    debug!(error = %e, "inbound frame is not codec data; delivering it as text");
                    self.emit(TransportEvent::Message(Value::String(text.to_string())));
                }
                Err(_) => warn!(error = %e, "dropping inbound frame that failed to decode"),
            },
        }
    }

    fn sync_queue_len(&self) {
        let len = self.queue.len();
        self.stats_tx.send_if_modified(|stats| {
            let changed = stats.queued_messages != len;
            stats.queued_messages = len;
            changed
        });
    }

    fn emit(&self, event: TransportEvent) {
        self.listeners.emit(&event);
    }
}

/// Perform one WebSocket handshake bounded by `timeout`.
async fn establish(url: String, timeout: std::time::Duration) -> Result<WsStream, LinkError> {
    match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(LinkError::Transport(format!("handshake with {url} failed: {e}"))),
        Err(_) => Err(LinkError::Timeout(timeout.as_millis() as u64)),
    }
}
