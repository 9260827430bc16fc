//! `skylink-middleware` – topic message bus over the device connection.
//!
//! # Modules
//!
//! - [`envelope`] – tolerant parsing of inbound payloads into `{topic, data}`
//!   envelopes.
//! - [`middleware`] – the [`Middleware`] trait, [`Flow`] and the built-in
//!   [`LogMiddleware`] / [`TopicFilter`].
//! - [`bus`] – [`MessageBus`]: subscription registry, middleware chain,
//!   dispatch with retry, and `publish`.
//! - [`link`] – [`DeviceLink`], the session-wide owner of one transport and
//!   one bus.

pub mod bus;
pub mod envelope;
pub mod link;
pub mod middleware;

pub use bus::{BoxError, BusConfig, MessageBus, Subscription, SubscriptionId};
pub use envelope::{DEFAULT_TOPIC, parse_message};
pub use link::DeviceLink;
pub use middleware::{Flow, LogMiddleware, Middleware, TopicFilter};
pub use skylink_types::Envelope;
