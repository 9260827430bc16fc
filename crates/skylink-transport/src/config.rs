//! Construction options for [`TransportManager`](crate::TransportManager).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{Codec, JsonCodec};

/// Delay between reconnection attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5_000);
/// Reconnection attempts made after a drop before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Period of the keep-alive ping while the connection is open.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(30_000);
/// Upper bound on a single WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Configuration bundle for the transport.
///
/// Only `url` is required; every other field has a default.  Fields are
/// public so callers can use struct-update syntax, and the `with_*` methods
/// allow builder-style construction.
#[derive(Clone)]
pub struct TransportConfig {
    /// `ws://` or `wss://` address of the device-control backend.
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub codec: Arc<dyn Codec>,
    /// Log every inbound and outbound frame at `debug` level.
    pub debug: bool,
    /// Send `Binary` frames instead of `Text` frames.
    pub binary: bool,
    /// Optional bound on the outbound queue.  `None` keeps every frame; when
    /// set, the oldest queued frame is evicted to make room for a new one.
    pub max_queue_len: Option<usize>,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            codec: Arc::new(JsonCodec),
            debug: false,
            binary: false,
            max_queue_len: None,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    pub fn with_max_queue_len(mut self, max: Option<usize>) -> Self {
        self.max_queue_len = max;
        self
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("codec", &"<dyn Codec>")
            .field("debug", &self.debug)
            .field("binary", &self.binary)
            .field("max_queue_len", &self.max_queue_len)
            .finish()
    }
}
