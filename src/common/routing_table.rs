//! Simplified Kademlia routing table.

use std::collections::BTreeMap;

use crate::common::{Id, Node};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// K-buckets of nodes keyed by their distance to this node's id.
#[derive(Debug)]
pub struct RoutingTable {
    id: Id,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    pub fn new(id: Id) -> RoutingTable {
        RoutingTable {
            id,
            buckets: BTreeMap::new(),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Total number of nodes across all buckets.
    pub fn size(&self) -> usize {
        self.buckets.values().map(|bucket| bucket.nodes.len()).sum()
    }

    // === Public Methods ===

    /// Attempt to add a node to this routing table.
    ///
    /// Nodes with this table's own id are ignored. A full bucket only
    /// accepts the node if its least recently seen node went stale.
    pub fn add(&mut self, node: Node) -> bool {
        let distance = self.id.distance(node.id());

        if distance == 0 {
            // Do not add self to the routing table
            return false;
        }

        self.buckets.entry(distance).or_insert_with(KBucket::new).add(node)
    }

    pub fn remove(&mut self, node_id: &Id) {
        let distance = self.id.distance(node_id);

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(node_id);
        }
    }

    /// Closest non-stale nodes to a target, at most [MAX_BUCKET_SIZE_K].
    pub fn closest(&self, target: &Id) -> Vec<Node> {
        let mut nodes = self
            .buckets
            .values()
            .flat_map(|bucket| bucket.nodes.iter())
            .filter(|node| !node.is_stale())
            .cloned()
            .collect::<Vec<_>>();

        nodes.sort_by_key(|node| node.id().xor(target));
        nodes.truncate(MAX_BUCKET_SIZE_K);

        nodes
    }

    /// All nodes in the routing table.
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.nodes.iter())
            .cloned()
            .collect()
    }

    /// Export the addresses of the closest nodes to this node's id,
    /// usable as a bootstrap list for other nodes.
    pub fn to_bootstrap(&self) -> Vec<String> {
        self.closest(&self.id)
            .iter()
            .map(|node| node.address().to_string())
            .collect()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        let distance = self.id.distance(node_id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.contains(node_id))
            .unwrap_or(false)
    }
}

/// A bucket of nodes at the same distance, ordered least recently seen first.
#[derive(Debug)]
struct KBucket {
    nodes: Vec<Node>,
}

impl KBucket {
    fn new() -> Self {
        KBucket {
            nodes: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn contains(&self, id: &Id) -> bool {
        self.nodes.iter().any(|node| node.id() == id)
    }

    fn add(&mut self, incoming: Node) -> bool {
        if let Some(index) = self.nodes.iter().position(|node| node.id() == incoming.id()) {
            if self.nodes[index].same_ip(&incoming) {
                // Move to the most recently seen end with a fresh timestamp.
                self.nodes.remove(index);
                self.nodes.push(incoming);
                return true;
            }

            // An id claimed from a different IP is refused.
            return false;
        }

        if self.nodes.len() < MAX_BUCKET_SIZE_K {
            self.nodes.push(incoming);
            return true;
        }

        if self.nodes[0].is_stale() {
            self.nodes.remove(0);
            self.nodes.push(incoming);
            return true;
        }

        false
    }

    fn remove(&mut self, id: &Id) {
        self.nodes.retain(|node| node.id() != id);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::common::ID_SIZE;

    #[test]
    fn is_empty() {
        let mut table = RoutingTable::new(Id::random());
        assert!(table.is_empty());

        table.add(Node::random());
        assert!(!table.is_empty());
    }

    #[test]
    fn does_not_add_self() {
        let id = Id::random();
        let mut table = RoutingTable::new(id);

        assert!(!table.add(Node::new(id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))));
        assert!(table.is_empty());
    }

    #[test]
    fn contains_and_remove() {
        let mut table = RoutingTable::new(Id::random());
        let node = Node::random();

        table.add(node.clone());
        assert!(table.contains(node.id()));

        table.remove(node.id());
        assert!(!table.contains(node.id()));
    }

    #[test]
    fn buckets_are_bounded() {
        let id = Id::from([0_u8; ID_SIZE]);
        let mut table = RoutingTable::new(id);

        // All these nodes land in the furthest bucket.
        for i in 0..(MAX_BUCKET_SIZE_K + 5) {
            let mut bytes = [0xff_u8; ID_SIZE];
            bytes[ID_SIZE - 1] = i as u8;

            table.add(Node::new(
                Id::from(bytes),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), i as u16),
            ));
        }

        assert_eq!(table.size(), MAX_BUCKET_SIZE_K);
    }

    #[test]
    fn full_bucket_accepts_replacement_of_stale_head() {
        let id = Id::from([0_u8; ID_SIZE]);
        let mut table = RoutingTable::new(id);

        let stale_head = {
            let mut bytes = [0xff_u8; ID_SIZE];
            bytes[ID_SIZE - 1] = 0;
            Node::stale(Id::from(bytes), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1))
        };
        table.add(stale_head.clone());

        for i in 1..MAX_BUCKET_SIZE_K {
            let mut bytes = [0xff_u8; ID_SIZE];
            bytes[ID_SIZE - 1] = i as u8;

            table.add(Node::new(
                Id::from(bytes),
                SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), i as u16),
            ));
        }

        let mut bytes = [0xff_u8; ID_SIZE];
        bytes[ID_SIZE - 1] = 255;
        let newcomer = Node::new(
            Id::from(bytes),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1),
        );

        assert!(table.add(newcomer.clone()));
        assert!(!table.contains(stale_head.id()));
        assert!(table.contains(newcomer.id()));
    }

    #[test]
    fn refuses_id_from_different_ip() {
        let mut table = RoutingTable::new(Id::random());

        let id = Id::random();
        let original = Node::new(id, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1));
        let imposter = Node::new(id, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1));

        assert!(table.add(original));
        assert!(!table.add(imposter));
    }

    #[test]
    fn closest_returns_nearest_first() {
        let target = Id::from([0_u8; ID_SIZE]);
        let mut table = RoutingTable::new(Id::random());

        let mut near = [0_u8; ID_SIZE];
        near[0] = 5;
        let near = Node::new(Id::from(near), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5));

        let mut far = [0_u8; ID_SIZE];
        far[0] = 10;
        let far = Node::new(Id::from(far), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 10));

        table.add(far.clone());
        table.add(near.clone());

        let closest = table.closest(&target);

        assert_eq!(closest.first().map(|node| *node.id()), Some(*near.id()));
    }

    #[test]
    fn closest_skips_stale_nodes() {
        let mut table = RoutingTable::new(Id::random());
        let stale = Node::stale(Id::random(), SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1));

        table.add(stale.clone());
        table.add(Node::random());

        let closest = table.closest(&Id::random());

        assert_eq!(closest.len(), 1);
        assert_ne!(closest[0].id(), stale.id());
    }
}
