use keyroute_core::hash::fnv1a_hash;

use super::NodeLocator;
use crate::traits::NodeHandle;

/// Points placed on the ring for every node.
const POINTS_PER_NODE: usize = 100;

/// Consistent-hashing locator for buckets without a vbucket map.
///
/// Only alive nodes are placed on the ring. When a node dies the pool builds
/// a fresh ring from the remaining alive nodes; there are no partial updates.
#[derive(Debug, Default)]
pub struct HashRingLocator {
    nodes: Vec<NodeHandle>,
    /// Sorted by hash.
    ring: Vec<(u32, usize)>,
}

impl HashRingLocator {
    #[must_use]
    pub fn new(nodes: &[NodeHandle]) -> Self {
        let mut locator = Self::default();
        locator.initialize(nodes);
        locator
    }

    /// Number of nodes on the ring.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeLocator for HashRingLocator {
    fn initialize(&mut self, nodes: &[NodeHandle]) {
        self.nodes = nodes.iter().filter(|n| n.is_alive()).cloned().collect();
        self.ring.clear();
        self.ring.reserve(self.nodes.len() * POINTS_PER_NODE);
        for (slot, node) in self.nodes.iter().enumerate() {
            for point in 0..POINTS_PER_NODE {
                let label = format!("{}-{point}", node.endpoint());
                self.ring.push((fnv1a_hash(label.as_bytes()), slot));
            }
        }
        self.ring.sort_unstable();
    }

    fn locate(&self, key: &str) -> Option<NodeHandle> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = fnv1a_hash(key.as_bytes());
        let pos = self.ring.partition_point(|(point, _)| *point < hash);
        let (_, slot) = self.ring[pos % self.ring.len()];
        self.nodes.get(slot).cloned()
    }

    fn working_nodes(&self) -> Vec<NodeHandle> {
        self.nodes.iter().filter(|n| n.is_alive()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::test_support::MockNode;
    use crate::traits::Node;

    fn nodes(count: usize) -> Vec<std::sync::Arc<MockNode>> {
        (0..count)
            .map(|i| MockNode::standalone(&format!("10.0.1.{i}:11210")))
            .collect()
    }

    fn handles(nodes: &[std::sync::Arc<MockNode>]) -> Vec<NodeHandle> {
        nodes.iter().map(|n| n.clone() as NodeHandle).collect()
    }

    #[test]
    fn empty_ring_locates_nothing() {
        let locator = HashRingLocator::new(&[]);
        assert!(locator.is_empty());
        assert!(locator.locate("k").is_none());
    }

    #[test]
    fn keys_spread_over_all_nodes_and_stay_put() {
        let nodes = nodes(3);
        let locator = HashRingLocator::new(&handles(&nodes));
        assert_eq!(locator.len(), 3);

        let mut seen = HashSet::new();
        for i in 0..300 {
            let key = format!("key-{i}");
            let first = locator.locate(&key).unwrap();
            let second = locator.locate(&key).unwrap();
            assert_eq!(first.endpoint(), second.endpoint());
            seen.insert(first.endpoint().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn dead_nodes_are_left_off_the_ring() {
        let nodes = nodes(3);
        nodes[1].kill();
        let locator = HashRingLocator::new(&handles(&nodes));
        assert_eq!(locator.len(), 2);
        for i in 0..200 {
            let node = locator.locate(&format!("key-{i}")).unwrap();
            assert_ne!(node.endpoint(), nodes[1].endpoint());
        }
    }

    #[test]
    fn rebuilding_only_moves_keys_of_the_removed_node() {
        let nodes = nodes(4);
        let full = HashRingLocator::new(&handles(&nodes));
        nodes[2].kill();
        let reduced = HashRingLocator::new(&handles(&nodes));

        for i in 0..500 {
            let key = format!("doc::{i}");
            let before = full.locate(&key).unwrap();
            let after = reduced.locate(&key).unwrap();
            if before.endpoint() != nodes[2].endpoint() {
                assert_eq!(before.endpoint(), after.endpoint());
            }
        }
    }

    #[test]
    fn working_nodes_reflect_liveness() {
        let nodes = nodes(2);
        let locator = HashRingLocator::new(&handles(&nodes));
        assert_eq!(locator.working_nodes().len(), 2);
        nodes[0].kill();
        assert_eq!(locator.working_nodes().len(), 1);
    }
}
