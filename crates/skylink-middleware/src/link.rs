//! [`DeviceLink`] – the one transport and one bus an application session
//! talks to the device backend through.

use skylink_transport::{TransportConfig, TransportManager};
use tracing::info;

use crate::bus::{BusConfig, MessageBus};

/// Owns the session's [`TransportManager`] and [`MessageBus`].
///
/// Construct it once at startup and hand clones (or the accessors' results)
/// to whatever needs to publish or subscribe.  [`shutdown`][Self::shutdown]
/// is the single teardown call.
#[derive(Clone)]
pub struct DeviceLink {
    transport: TransportManager,
    bus: MessageBus,
}

impl DeviceLink {
    /// Start connecting and attach a bus to the connection.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(transport: TransportConfig, bus: BusConfig) -> Self {
        let transport = TransportManager::connect(transport);
        let bus = MessageBus::new(transport.clone(), bus);
        Self { transport, bus }
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Close the connection for good.  Safe to call more than once.
    pub fn shutdown(&self) {
        info!("device link shutting down");
        self.transport.close();
    }
}
