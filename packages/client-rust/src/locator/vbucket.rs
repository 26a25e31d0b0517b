use std::sync::Arc;

use keyroute_core::{VBucket, VBucketMap};

use super::NodeLocator;
use crate::traits::NodeHandle;

/// Routes keys through the server-provided vbucket map.
///
/// `nodes` is indexed like the map's server list.
///
/// NOTE: unlike [`HashRingLocator`](super::HashRingLocator), this locator is
/// not rebuilt when a node dies. The vbucket map is owned by the cluster, and
/// moving vbuckets locally would break its replication layout. Routing only
/// changes when a new configuration arrives (usually through a
/// not-my-vbucket redirect). Keep the two failure behaviours separate.
#[derive(Debug)]
pub struct VBucketLocator {
    map: Arc<VBucketMap>,
    nodes: Vec<NodeHandle>,
}

impl VBucketLocator {
    #[must_use]
    pub fn new(map: Arc<VBucketMap>, nodes: &[NodeHandle]) -> Self {
        let mut locator = Self {
            map,
            nodes: Vec::new(),
        };
        locator.initialize(nodes);
        locator
    }

    #[must_use]
    pub fn map(&self) -> &Arc<VBucketMap> {
        &self.map
    }

    /// The vbucket `key` hashes to, with its master and replica slots.
    #[must_use]
    pub fn vbucket(&self, key: &str) -> &VBucket {
        self.map.vbucket_for(key.as_bytes())
    }

    /// Node at a server-list index. `None` for `-1` or out-of-range slots.
    #[must_use]
    pub fn node_at(&self, index: usize) -> Option<NodeHandle> {
        self.nodes.get(index).cloned()
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }
}

impl NodeLocator for VBucketLocator {
    fn initialize(&mut self, nodes: &[NodeHandle]) {
        self.nodes = nodes.to_vec();
    }

    fn locate(&self, key: &str) -> Option<NodeHandle> {
        self.vbucket(key)
            .master()
            .and_then(|index| self.node_at(index))
    }

    fn working_nodes(&self) -> Vec<NodeHandle> {
        self.nodes.iter().filter(|n| n.is_alive()).cloned().collect()
    }

    fn as_vbucket(&self) -> Option<&VBucketLocator> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use keyroute_core::HashAlgorithm;
    use proptest::prelude::*;

    use super::*;
    use crate::test_support::MockNode;
    use crate::traits::Node;

    fn nodes(count: usize) -> Vec<Arc<MockNode>> {
        (0..count)
            .map(|i| MockNode::standalone(&format!("10.0.0.{}:11210", i + 1)))
            .collect()
    }

    fn handles(nodes: &[Arc<MockNode>]) -> Vec<NodeHandle> {
        nodes.iter().map(|n| n.clone() as NodeHandle).collect()
    }

    fn map(entries: Vec<Vec<i32>>, servers: usize) -> Arc<VBucketMap> {
        Arc::new(VBucketMap::build(HashAlgorithm::Crc, 1, servers, &entries).unwrap())
    }

    #[test]
    fn locate_returns_the_master() {
        let nodes = nodes(3);
        let entries = (0..64).map(|v| vec![v % 3, (v + 1) % 3]).collect();
        let locator = VBucketLocator::new(map(entries, 3), &handles(&nodes));

        for i in 0..100 {
            let key = format!("user::{i}");
            let vb = locator.vbucket(&key);
            let master = vb.master().unwrap();
            assert_eq!(
                locator.locate(&key).unwrap().endpoint(),
                nodes[master].endpoint()
            );
        }
    }

    #[test]
    fn unassigned_master_locates_nothing() {
        let nodes = nodes(2);
        let locator = VBucketLocator::new(map(vec![vec![-1, 0]], 2), &handles(&nodes));
        assert!(locator.locate("anything").is_none());
    }

    #[test]
    fn dead_master_is_still_returned() {
        let nodes = nodes(2);
        let locator = VBucketLocator::new(map(vec![vec![0, 1]], 2), &handles(&nodes));
        nodes[0].kill();

        let located = locator.locate("k").unwrap();
        assert_eq!(located.endpoint(), nodes[0].endpoint());
        assert!(!located.is_alive());
        assert_eq!(locator.working_nodes().len(), 1);
    }

    #[test]
    fn node_at_rejects_out_of_range() {
        let nodes = nodes(2);
        let locator = VBucketLocator::new(map(vec![vec![0, 1]], 2), &handles(&nodes));
        assert!(locator.node_at(1).is_some());
        assert!(locator.node_at(2).is_none());
        assert!(locator.as_vbucket().is_some());
    }

    proptest! {
        #[test]
        fn routing_is_deterministic(keys in proptest::collection::vec("[a-z0-9:_-]{1,32}", 1..64)) {
            let nodes = nodes(4);
            let entries = (0..256).map(|v| vec![v % 4, (v + 1) % 4]).collect();
            let map = map(entries, 4);
            let first = VBucketLocator::new(Arc::clone(&map), &handles(&nodes));
            let second = VBucketLocator::new(map, &handles(&nodes));

            for key in &keys {
                let a = first.locate(key).unwrap();
                let b = first.locate(key).unwrap();
                let c = second.locate(key).unwrap();
                prop_assert_eq!(a.endpoint(), b.endpoint());
                prop_assert_eq!(a.endpoint(), c.endpoint());
            }
        }
    }
}
