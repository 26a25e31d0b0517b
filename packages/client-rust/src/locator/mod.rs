//! Key → node mapping.
//!
//! Two strategies, picked per configuration:
//!
//! - [`VBucketLocator`] for buckets with a server-provided vbucket map
//! - [`HashRingLocator`] (consistent hashing) for basic buckets
//!
//! [`NotFoundLocator`] backs the empty pool state and never resolves a key.
//!
//! Locators are immutable once built and shared through the pool snapshot.
//! Changing routing means building a new locator.

mod hash_ring;
mod vbucket;

use std::fmt;

pub use hash_ring::HashRingLocator;
pub use vbucket::VBucketLocator;

use crate::traits::NodeHandle;

/// Maps keys to nodes.
pub trait NodeLocator: Send + Sync + fmt::Debug {
    /// Rebuilds the internal structures from a node list.
    fn initialize(&mut self, nodes: &[NodeHandle]);

    /// The node responsible for `key`, or `None` when no node is.
    fn locate(&self, key: &str) -> Option<NodeHandle>;

    /// Nodes that are currently alive.
    fn working_nodes(&self) -> Vec<NodeHandle>;

    /// Downcast used by the durability and replica paths.
    fn as_vbucket(&self) -> Option<&VBucketLocator> {
        None
    }
}

/// Locator of the empty pool state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotFoundLocator;

impl NodeLocator for NotFoundLocator {
    fn initialize(&mut self, _nodes: &[NodeHandle]) {}

    fn locate(&self, _key: &str) -> Option<NodeHandle> {
        None
    }

    fn working_nodes(&self) -> Vec<NodeHandle> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_locator_resolves_nothing() {
        let locator = NotFoundLocator;
        assert!(locator.locate("any").is_none());
        assert!(locator.working_nodes().is_empty());
        assert!(locator.as_vbucket().is_none());
    }
}
