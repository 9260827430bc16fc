//! [`MessageBus`] – topic-based publish/subscribe on top of a
//! [`TransportManager`].
//!
//! Inbound payloads are parsed into envelopes
//! ([`parse_message`](crate::envelope::parse_message)), run through the
//! middleware chain and handed to every handler subscribed to the envelope's
//! topic.  Outbound, [`MessageBus::publish`] wraps `data` in a
//! `{"topic", "data"}` envelope and gives it to the transport.
//!
//! The subscription registry and the middleware chain are owned by one
//! *dispatch task*.  Subscriptions, middleware registrations and inbound
//! messages travel over the same channel, so they take effect in the order
//! they were issued.
//!
//! # Failure handling
//!
//! | Failure | Outcome |
//! |---|---|
//! | Middleware returns [`Flow::Halt`] | Message consumed, nothing else happens |
//! | Middleware errors or panics | Whole pipeline retried `max_retries` times, `retry_delay` apart, then dropped |
//! | Handler errors or panics | Logged; remaining handlers still run, no retry |
//! | No subscribers for the topic | No-op |

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use skylink_transport::{EventKind, TransportEvent, TransportManager};
use skylink_types::{Envelope, LinkError};
use tokio::sync::{mpsc, oneshot};
use tracing::{Level, debug, error, warn};
use uuid::Uuid;

use crate::envelope::parse_message;
use crate::middleware::{Flow, Middleware, log_envelope};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Error type handlers may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&Value, &str) -> Result<(), BoxError> + Send + Sync>;

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Most verbose level the bus itself logs at.  Per-message records are
    /// emitted at `DEBUG` and therefore only appear at `DEBUG` or `TRACE`.
    pub log_level: Level,
    /// Extra attempts after a failed dispatch.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl BusConfig {
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Identifies one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum Command {
    Inbound(Value),
    Retry {
        envelope: Envelope,
        attempt: u32,
    },
    Subscribe {
        topic: String,
        id: SubscriptionId,
        handler: Handler,
    },
    Unsubscribe {
        topic: String,
        id: SubscriptionId,
    },
    Use(Arc<dyn Middleware>),
    Topics(oneshot::Sender<Vec<String>>),
    Clear(String),
}

// ---------------------------------------------------------------------------
// MessageBus (public handle)
// ---------------------------------------------------------------------------

/// Handle to the bus.  Clones share the same registry and chain.
#[derive(Clone)]
pub struct MessageBus {
    cmd_tx: mpsc::UnboundedSender<Command>,
    transport: TransportManager,
}

impl MessageBus {
    /// Attach a bus to `transport` and spawn its dispatch task.
    ///
    /// The bus registers itself as a `Message` listener on the transport.
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: TransportManager, config: BusConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let inbound = cmd_tx.clone();
        transport.on(EventKind::Message, move |event: &TransportEvent| {
            if let TransportEvent::Message(raw) = event {
                if inbound.send(Command::Inbound(raw.clone())).is_err() {
                    debug!("bus dispatch task has stopped; inbound message discarded");
                }
            }
        });

        let actor = DispatchActor {
            config,
            cmd_rx,
            retry_tx: cmd_tx.downgrade(),
            registry: HashMap::new(),
            chain: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self { cmd_tx, transport }
    }

    /// Register `handler` for `topic`.
    ///
    /// The handler runs on the dispatch task with `(data, topic)` and must
    /// not block.  Keep the returned [`Subscription`] to remove it later.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value, &str) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = SubscriptionId::new();
        self.dispatch(Command::Subscribe {
            topic: topic.clone(),
            id,
            handler: Arc::new(handler),
        });
        Subscription {
            topic,
            id,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Like [`subscribe`][Self::subscribe], but deserialises `data` into `T`
    /// first.  A payload that does not fit `T` counts as a handler error.
    pub fn subscribe_typed<T, F>(&self, topic: impl Into<String>, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &str) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe(topic, move |data: &Value, topic: &str| {
            let typed: T = serde_json::from_value(data.clone())?;
            handler(typed, topic)
        })
    }

    /// Remove one handler.  The topic disappears once its last handler is
    /// gone.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        self.dispatch(Command::Unsubscribe {
            topic: topic.to_string(),
            id,
        });
    }

    /// Send `{"topic": topic, "data": data}` through the transport.
    ///
    /// Fire-and-forget: the transport queues it while disconnected.  A value
    /// that cannot be serialised is logged and dropped.
    pub fn publish<T>(&self, topic: &str, data: &T)
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(data) {
            Ok(data) => self.transport.send(&json!({ "topic": topic, "data": data })),
            Err(e) => warn!(topic, error = %e, "dropping publish that failed to serialise"),
        }
    }

    /// Append `middleware` to the chain.  Returns `self` for chaining.
    pub fn use_middleware<M>(&self, middleware: M) -> &Self
    where
        M: Middleware + 'static,
    {
        self.dispatch(Command::Use(Arc::new(middleware)));
        self
    }

    /// Topics with at least one handler, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(Command::Topics(reply));
        rx.await.unwrap_or_default()
    }

    /// Drop every handler registered for `topic`.
    pub fn clear_topic(&self, topic: &str) {
        self.dispatch(Command::Clear(topic.to_string()));
    }

    /// Run `raw` through the dispatch pipeline as if it had just arrived
    /// from the transport.
    pub fn inject(&self, raw: Value) {
        self.dispatch(Command::Inbound(raw));
    }

    fn dispatch(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            debug!("bus dispatch task has stopped; command discarded");
        }
    }
}

/// Handle returned by [`MessageBus::subscribe`].
///
/// Dropping it leaves the handler registered; call
/// [`unsubscribe`][Self::unsubscribe] to remove it.
pub struct Subscription {
    topic: String,
    id: SubscriptionId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove exactly this handler (and the topic, if it was the last one).
    pub fn unsubscribe(self) {
        let cmd = Command::Unsubscribe {
            topic: self.topic,
            id: self.id,
        };
        if self.cmd_tx.send(cmd).is_err() {
            debug!("bus dispatch task has stopped; unsubscribe discarded");
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

struct DispatchActor {
    config: BusConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    /// Weak so pending retries do not keep the task alive.
    retry_tx: mpsc::WeakUnboundedSender<Command>,
    registry: HashMap<String, Vec<(SubscriptionId, Handler)>>,
    chain: Vec<Arc<dyn Middleware>>,
}

impl DispatchActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Inbound(raw) => {
                    let envelope = parse_message(raw);
                    self.dispatch(envelope, 0);
                }
                Command::Retry { envelope, attempt } => self.dispatch(envelope, attempt),
                Command::Subscribe { topic, id, handler } => {
                    self.registry.entry(topic).or_default().push((id, handler));
                }
                Command::Unsubscribe { topic, id } => self.remove(&topic, id),
                Command::Use(middleware) => self.chain.push(middleware),
                Command::Topics(reply) => {
                    let mut topics: Vec<String> = self.registry.keys().cloned().collect();
                    topics.sort();
                    if reply.send(topics).is_err() {
                        debug!("topics() caller went away before the reply");
                    }
                }
                Command::Clear(topic) => {
                    if let Some(handlers) = self.registry.remove(&topic) {
                        if self.logs(Level::DEBUG) {
                            debug!(topic, handlers = handlers.len(), "topic cleared");
                        }
                    }
                }
            }
        }
        debug!("bus dispatch task stopped");
    }

    fn remove(&mut self, topic: &str, id: SubscriptionId) {
        let Some(handlers) = self.registry.get_mut(topic) else {
            return;
        };
        handlers.retain(|(handler_id, _)| *handler_id != id);
        if handlers.is_empty() {
            self.registry.remove(topic);
        }
    }

    /// Whether the bus's configured verbosity admits records at `level`.
    fn logs(&self, level: Level) -> bool {
        level <= self.config.log_level
    }

    fn dispatch(&self, envelope: Envelope, attempt: u32) {
        if self.logs(Level::DEBUG) {
            log_envelope(Level::DEBUG, "dispatching", &envelope.topic, &envelope.data);
        }
        let Err(e) = self.run_pipeline(&envelope) else {
            return;
        };

        if attempt < self.config.max_retries {
            if self.logs(Level::WARN) {
                warn!(
                    topic = %envelope.topic,
                    attempt = attempt + 1,
                    max_retries = self.config.max_retries,
                    error = %e,
                    "dispatch failed; retrying"
                );
            }
            self.schedule_retry(envelope, attempt + 1);
        } else if self.logs(Level::ERROR) {
            error!(
                topic = %envelope.topic,
                attempts = attempt + 1,
                error = %e,
                "dispatch failed; message dropped"
            );
        }
    }

    /// Middleware chain, then every handler of the topic.  Only middleware
    /// failures are returned; handler failures are contained here.
    fn run_pipeline(&self, envelope: &Envelope) -> Result<(), LinkError> {
        let topic = envelope.topic.as_str();
        let mut data = envelope.data.clone();

        for middleware in &self.chain {
            let step = catch_unwind(AssertUnwindSafe(|| middleware.process(topic, data)))
                .map_err(|panic| {
                    LinkError::Middleware(format!("middleware panicked: {}", panic_message(&*panic)))
                })?;
            match step? {
                Flow::Continue(next) => data = next,
                Flow::Halt => {
                    if self.logs(Level::DEBUG) {
                        debug!(topic, "message halted by middleware");
                    }
                    return Ok(());
                }
            }
        }

        let Some(handlers) = self.registry.get(topic) else {
            return Ok(());
        };
        for (id, handler) in handlers {
            let failure = match catch_unwind(AssertUnwindSafe(|| handler(&data, topic))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
            };
            if self.logs(Level::WARN) {
                let error = LinkError::Handler {
                    topic: topic.to_string(),
                    details: failure,
                };
                warn!(subscription = ?id, error = %error, "handler failed");
            }
        }
        Ok(())
    }

    fn schedule_retry(&self, envelope: Envelope, attempt: u32) {
        let retry_tx = self.retry_tx.clone();
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let delivered = retry_tx
                .upgrade()
                .is_some_and(|tx| tx.send(Command::Retry { envelope, attempt }).is_ok());
            if !delivered {
                debug!(attempt, "bus dispatch task has stopped; retry discarded");
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
