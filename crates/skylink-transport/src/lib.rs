//! `skylink-transport` – The Wire
//!
//! Owns the single full-duplex WebSocket connection between the observatory
//! dashboard and the device-control backend.  Payloads are opaque here; the
//! topic semantics live in `skylink-middleware`.
//!
//! # Modules
//!
//! - [`connection`] – [`TransportManager`]: connection state machine,
//!   reconnection with fixed backoff, keep-alive heartbeat and the outbound
//!   queue that buffers sends while disconnected.
//! - [`events`] – [`TransportEvent`] lifecycle events and the typed listener
//!   registry behind [`TransportManager::on`] / [`TransportManager::off`].
//! - [`codec`] – the pluggable [`Codec`] used to (de)serialise frames, with
//!   the default [`JsonCodec`].
//! - [`config`] – [`TransportConfig`] construction options and defaults.

pub mod codec;
pub mod config;
pub mod connection;
pub mod events;

pub use codec::{Codec, JsonCodec};
pub use config::TransportConfig;
pub use connection::{TransportManager, heartbeat_payload};
pub use events::{EventKind, ListenerId, TransportEvent};
pub use skylink_types::{ConnectionState, ConnectionStats, LinkError};
