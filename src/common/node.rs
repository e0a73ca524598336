//! Struct and implementation of the Node entry in the Kademlia routing table.

use std::fmt::{self, Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::common::{Id, ID_SIZE};

/// A node is dropped from the routing table after this long without any contact.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);
/// A node is pinged once it has been quiet for this long.
const PING_AFTER: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub(crate) struct NodeInner {
    pub(crate) id: Id,
    pub(crate) address: SocketAddrV4,
    pub(crate) last_seen: Instant,
}

/// Node entry in the routing table or a lookup candidate.
#[derive(Clone)]
pub struct Node(pub(crate) Arc<NodeInner>);

impl Node {
    /// Create a new node from its id and address, seen just now.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node(Arc::new(NodeInner {
            id,
            address,
            last_seen: Instant::now(),
        }))
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.0.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.0.address
    }

    /// Node has been quiet for so long that it can't be trusted to be alive.
    pub fn is_stale(&self) -> bool {
        self.0.last_seen.elapsed() >= STALE_TIME
    }

    /// Node has been quiet for long enough that it is worth confirming
    /// it is still reachable.
    pub fn should_ping(&self) -> bool {
        self.0.last_seen.elapsed() >= PING_AFTER
    }

    pub fn same_address(&self, other: &Node) -> bool {
        self.address() == other.address()
    }

    pub fn same_ip(&self, other: &Node) -> bool {
        self.address().ip() == other.address().ip()
    }

    // === Test helpers ===

    /// Create a node with random id and address, seen just now.
    pub fn random() -> Node {
        Node::new(
            Id::random(),
            SocketAddrV4::new(Ipv4Addr::from(rand::random::<u32>()), rand::random()),
        )
    }

    /// Create a node with a deterministic id and address derived from `i`.
    pub fn unique(i: usize) -> Node {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[ID_SIZE - 8..].copy_from_slice(&(i as u64).to_be_bytes());

        Node::new(
            Id::from(bytes),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), i as u16),
        )
    }

    /// Create a node with the given id and a stale `last_seen`.
    #[cfg(test)]
    pub(crate) fn stale(id: Id, address: SocketAddrV4) -> Node {
        Node(Arc::new(NodeInner {
            id,
            address,
            last_seen: Instant::now() - STALE_TIME,
        }))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.address() == other.address()
    }
}

impl Eq for Node {}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", self.id())
            .field("address", &self.address())
            .field("last_seen", &self.0.last_seen.elapsed().as_secs())
            .finish()
    }
}
