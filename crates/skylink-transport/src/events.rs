//! Lifecycle events emitted by the transport and the listener registry that
//! delivers them.

use std::sync::Arc;

use serde_json::Value;
use skylink_types::{ConnectionState, LinkError};
use uuid::Uuid;

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The handshake completed and the connection is usable.
    Open,
    /// A decoded inbound payload.
    Message(Value),
    /// A transport or codec failure.  Never fatal to the manager.
    Error(LinkError),
    /// The underlying connection closed (or a handshake attempt failed).
    Close,
    /// A reconnection attempt is starting; carries the 1-based attempt number.
    Reconnect(u32),
    /// The connection state changed.
    StateChange(ConnectionState),
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Open => EventKind::Open,
            TransportEvent::Message(_) => EventKind::Message,
            TransportEvent::Error(_) => EventKind::Error,
            TransportEvent::Close => EventKind::Close,
            TransportEvent::Reconnect(_) => EventKind::Reconnect,
            TransportEvent::StateChange(_) => EventKind::StateChange,
        }
    }
}

/// Discriminant used to pick which events a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Message,
    Error,
    Close,
    Reconnect,
    StateChange,
}

/// Handle returned by [`TransportManager::on`](crate::TransportManager::on),
/// used to remove that one listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

pub(crate) type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Ordered listener table owned by the connection task.
#[derive(Default)]
pub(crate) struct ListenerRegistry {
    entries: Vec<(ListenerId, EventKind, Listener)>,
}

impl ListenerRegistry {
    pub(crate) fn add(&mut self, id: ListenerId, kind: EventKind, listener: Listener) {
        self.entries.push((id, kind, listener));
    }

    /// Returns `false` when `id` was not registered.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Deliver `event` to every listener of its kind, in registration order.
    pub(crate) fn emit(&self, event: &TransportEvent) {
        let kind = event.kind();
        for (_, _, listener) in self.entries.iter().filter(|(_, k, _)| *k == kind) {
            listener(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener {
        let log = Arc::clone(log);
        Arc::new(move |event: &TransportEvent| {
            log.lock().unwrap().push(format!("{tag}:{:?}", event.kind()));
        })
    }

    #[test]
    fn emit_reaches_only_matching_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        registry.add(ListenerId::new(), EventKind::Open, recording(&log, "a"));
        registry.add(ListenerId::new(), EventKind::Close, recording(&log, "b"));

        registry.emit(&TransportEvent::Open);

        assert_eq!(*log.lock().unwrap(), vec!["a:Open".to_string()]);
    }

    #[test]
    fn multiple_listeners_per_kind_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        registry.add(ListenerId::new(), EventKind::Reconnect, recording(&log, "first"));
        registry.add(ListenerId::new(), EventKind::Reconnect, recording(&log, "second"));

        registry.emit(&TransportEvent::Reconnect(1));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:Reconnect".to_string(), "second:Reconnect".to_string()]
        );
    }

    #[test]
    fn remove_detaches_only_that_listener() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ListenerRegistry::default();
        let first = ListenerId::new();
        registry.add(first, EventKind::Close, recording(&log, "first"));
        registry.add(ListenerId::new(), EventKind::Close, recording(&log, "second"));

        assert!(registry.remove(first));
        assert!(!registry.remove(first), "second removal must report absence");
        registry.emit(&TransportEvent::Close);

        assert_eq!(registry.len(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["second:Close".to_string()]);
    }

    #[test]
    fn event_kind_mapping() {
        assert_eq!(TransportEvent::Message(Value::Null).kind(), EventKind::Message);
        assert_eq!(
            TransportEvent::StateChange(ConnectionState::Open).kind(),
            EventKind::StateChange
        );
        assert_eq!(
            TransportEvent::Error(LinkError::Transport("x".into())).kind(),
            EventKind::Error
        );
    }
}
