//! Manage closest nodes found in a query.

use crate::common::{Id, Node};

/// Nodes sorted by their XOR distance to a target, deduplicated by id.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The closest `count` nodes to the target.
    pub fn take(&self, count: usize) -> &[Node] {
        &self.nodes[..count.min(self.nodes.len())]
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.nodes.iter().any(|node| node.id() == id)
    }

    // === Public Methods ===

    /// Insert a node in its sorted position, ignoring ids already present.
    pub fn add(&mut self, node: Node) {
        let seek = node.id().xor(&self.target);

        match self
            .nodes
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
        {
            Ok(_) => {
                // Same distance to the target means the same id.
            }
            Err(index) => {
                self.nodes.insert(index, node);
            }
        }
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
