//! Information and statistics about a running node.

use std::net::SocketAddrV4;

use crate::common::Id;

use super::server::Counters;

/// A snapshot of a running node's state.
#[derive(Debug, Clone)]
pub struct Info {
    pub(crate) id: Id,
    pub(crate) local_addr: SocketAddrV4,
    pub(crate) routing_table_size: usize,
    pub(crate) provided_keys: usize,
    pub(crate) counters: Counters,
}

impl Info {
    /// This node's id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Number of nodes in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of keys with provider records stored on this node.
    pub fn provided_keys(&self) -> usize {
        self.provided_keys
    }

    /// Counters over inbound messages.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}
