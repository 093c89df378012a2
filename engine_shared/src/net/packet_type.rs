//! Packet type table.
//!
//! Binds a symbolic name and a one-byte wire tag to a handler. Senders look
//! tags up by name; the receive loop looks handlers up by tag.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::bimap::BijectiveMap;

use super::packet::Packet;

/// Tags are a single byte, so at most this many types can be registered.
pub const MAX_PACKET_TYPES: usize = 256;

/// Handler invoked with the owning context and the received packet.
pub type PacketHandler<C> = Arc<dyn Fn(&C, &Packet) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketTypeError {
    #[error("packet tag {0} is already registered")]
    DuplicateTag(u8),
    #[error("packet type name {0:?} is already registered")]
    DuplicateName(String),
    #[error("all {MAX_PACKET_TYPES} packet tags are in use")]
    CapacityExceeded,
}

/// Name <-> tag registry plus the handler bound to each tag.
pub struct PacketTypeTable<C> {
    names: BijectiveMap<String, u8>,
    handlers: HashMap<u8, PacketHandler<C>>,
}

impl<C> Default for PacketTypeTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PacketTypeTable<C> {
    pub fn new() -> Self {
        Self {
            // String and u8 are distinct types, so construction cannot fail.
            names: BijectiveMap::new().unwrap_or_else(|_| unreachable!()),
            handlers: HashMap::new(),
        }
    }

    /// Registers a new packet type. An existing registration is never replaced.
    pub fn register<F>(&mut self, name: &str, tag: u8, handler: F) -> Result<(), PacketTypeError>
    where
        F: Fn(&C, &Packet) + Send + Sync + 'static,
    {
        if self.handlers.len() >= MAX_PACKET_TYPES {
            return Err(PacketTypeError::CapacityExceeded);
        }
        if self.handlers.contains_key(&tag) {
            return Err(PacketTypeError::DuplicateTag(tag));
        }
        self.names
            .add(name.to_string(), tag)
            .map_err(|_| PacketTypeError::DuplicateName(name.to_string()))?;
        self.handlers.insert(tag, Arc::new(handler));
        Ok(())
    }

    pub fn tag_of(&self, name: &str) -> Option<u8> {
        self.names.try_get_value(&name.to_string())
    }

    pub fn name_of(&self, tag: u8) -> Option<String> {
        self.names.try_get_key(&tag)
    }

    /// Handler for `tag`, cloned out so it can run without the table borrowed.
    pub fn handler(&self, tag: u8) -> Option<PacketHandler<C>> {
        self.handlers.get(&tag).cloned()
    }

    pub fn contains_tag(&self, tag: u8) -> bool {
        self.handlers.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
