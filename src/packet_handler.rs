use crate::control_packets::ids;
use crate::error::{ParloError, Result};
use crate::network_client::{DataHandler, NetworkClient};
use crate::packet::Packet;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Maps application packet ids to handlers, so a protocol can be assembled
/// from independent per-message handlers instead of one big match. Install
/// the registry's [`as_data_handler`](PacketHandlerRegistry::as_data_handler)
/// closure as a client's received-data sink.
#[derive(Default)]
pub struct PacketHandlerRegistry {
    handlers: RwLock<FxHashMap<u8, DataHandler>>,
}

impl PacketHandlerRegistry {
    pub fn new() -> PacketHandlerRegistry {
        Default::default()
    }

    /// Registers a handler for a packet id. Reserved protocol ids and ids
    /// that already have a handler are rejected.
    pub fn register(&self, id: u8, handler: DataHandler) -> Result<()> {
        if id >= ids::HEARTBEAT {
            return Err(ParloError::InvalidArgument("cannot register a handler for a reserved packet id"));
        }

        match self.handlers.write().expect("handler registry lock poisoned").entry(id) {
            Entry::Occupied(_) => {
                Err(ParloError::InvalidArgument("a handler is already registered for this packet id"))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    /// Removes the handler for an id. Returns whether one was registered.
    pub fn deregister(&self, id: u8) -> bool {
        self.handlers.write().expect("handler registry lock poisoned").remove(&id).is_some()
    }

    /// Routes a packet to its handler. Returns whether a handler was found.
    pub fn dispatch(&self, client: &Arc<NetworkClient>, packet: &Packet) -> bool {
        let handler = self.handlers.read().expect("handler registry lock poisoned").get(&packet.id()).cloned();

        match handler {
            Some(handler) => {
                handler(client, packet);
                true
            }
            None => {
                debug!(id = packet.id(), "no handler registered for packet id");
                false
            }
        }
    }

    /// Adapts the registry into a received-data callback.
    pub fn as_data_handler(self: &Arc<Self>) -> DataHandler {
        let registry = self.clone();
        Arc::new(move |client, packet| {
            registry.dispatch(client, packet);
        })
    }
}
