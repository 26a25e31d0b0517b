//! Immutable pool snapshots.

use std::sync::Arc;

use keyroute_core::{ClusterConfig, VBucket, VBucketMap};
use tokio::sync::mpsc;
use tracing::debug;

use super::worker::PoolEvent;
use crate::error::ClientError;
use crate::locator::{HashRingLocator, NodeLocator, NotFoundLocator, VBucketLocator};
use crate::node::protocol::Request;
use crate::node::{FailureSink, NodeSpec};
use crate::traits::{NodeFactory, NodeHandle};

// ---------------------------------------------------------------------------
// OperationFactory
// ---------------------------------------------------------------------------

/// Stamps requests with the vbucket their key belongs to.
#[derive(Debug, Clone)]
pub enum OperationFactory {
    VBucketAware(Arc<VBucketMap>),
    /// Basic buckets have no vbuckets; every request carries vbucket 0.
    Basic,
}

impl OperationFactory {
    #[must_use]
    pub fn vbucket_for(&self, key: &str) -> u16 {
        match self {
            Self::VBucketAware(map) => map.index_of(key.as_bytes()),
            Self::Basic => 0,
        }
    }

    /// Points a request at the vbucket of its key.
    #[must_use]
    pub fn prepare(&self, mut request: Request) -> Request {
        if let Ok(key) = std::str::from_utf8(&request.key) {
            request.vbucket = self.vbucket_for(key);
        }
        request
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// Everything needed to reach the copies of one key, resolved from a single
/// snapshot.
#[derive(Debug, Clone)]
pub struct Route {
    pub vbucket: VBucket,
    pub master: Option<NodeHandle>,
    /// Assigned replicas in slot order. Unassigned slots are left out.
    pub replicas: Vec<NodeHandle>,
}

// ---------------------------------------------------------------------------
// InternalState
// ---------------------------------------------------------------------------

/// One complete pool state. Never mutated after construction; the pool
/// replaces it wholesale.
#[derive(Debug)]
pub struct InternalState {
    generation: u64,
    config: Option<Arc<ClusterConfig>>,
    nodes: Vec<NodeHandle>,
    locator: Arc<dyn NodeLocator>,
    operation_factory: OperationFactory,
    is_vbucket_aware: bool,
}

impl InternalState {
    /// The state of a pool with no usable configuration.
    #[must_use]
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            config: None,
            nodes: Vec::new(),
            locator: Arc::new(NotFoundLocator),
            operation_factory: OperationFactory::Basic,
            is_vbucket_aware: false,
        }
    }

    /// Builds nodes and a locator for `config`.
    ///
    /// Nodes get a [`FailureSink`] stamped with `generation`. On error the
    /// nodes created so far are closed in the background.
    pub(crate) fn build(
        config: ClusterConfig,
        generation: u64,
        factory: &dyn NodeFactory,
        bucket: &str,
        password: Option<&str>,
        events: &mpsc::Sender<PoolEvent>,
    ) -> Result<Self, ClientError> {
        let password = config.effective_password(password);
        let sink = FailureSink::new(events.clone(), generation);

        let (specs, map) = match &config.vbucket_server_map {
            Some(server_map) => {
                let map = Arc::new(VBucketMap::from_server_map(server_map)?);
                let specs: Vec<NodeSpec> = config
                    .vbucket_nodes()?
                    .into_iter()
                    .map(|node| NodeSpec::from_cluster_node(node, bucket, password))
                    .collect();
                (specs, Some(map))
            }
            None => {
                let specs = config
                    .healthy_nodes()
                    .map(|node| NodeSpec::from_cluster_node(node, bucket, password))
                    .collect();
                (specs, None)
            }
        };

        let mut nodes = Vec::with_capacity(specs.len());
        for spec in specs {
            match factory.create(spec, sink.clone()) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    dispose(nodes);
                    return Err(e.into());
                }
            }
        }

        let (locator, operation_factory): (Arc<dyn NodeLocator>, _) = match map {
            Some(map) => (
                Arc::new(VBucketLocator::new(Arc::clone(&map), &nodes)),
                OperationFactory::VBucketAware(map),
            ),
            None => (
                Arc::new(HashRingLocator::new(&nodes)),
                OperationFactory::Basic,
            ),
        };

        Ok(Self {
            generation,
            is_vbucket_aware: matches!(operation_factory, OperationFactory::VBucketAware(_)),
            config: Some(Arc::new(config)),
            nodes,
            locator,
            operation_factory,
        })
    }

    /// Same nodes, ring rebuilt from the ones alive right now.
    #[must_use]
    pub(crate) fn with_rebuilt_ring(&self) -> Self {
        Self {
            generation: self.generation,
            config: self.config.clone(),
            nodes: self.nodes.clone(),
            locator: Arc::new(HashRingLocator::new(&self.nodes)),
            operation_factory: self.operation_factory.clone(),
            is_vbucket_aware: self.is_vbucket_aware,
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.config.is_none()
    }

    #[must_use]
    pub fn config(&self) -> Option<&Arc<ClusterConfig>> {
        self.config.as_ref()
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    #[must_use]
    pub fn locator(&self) -> &Arc<dyn NodeLocator> {
        &self.locator
    }

    #[must_use]
    pub fn operation_factory(&self) -> &OperationFactory {
        &self.operation_factory
    }

    #[must_use]
    pub fn is_vbucket_aware(&self) -> bool {
        self.is_vbucket_aware
    }

    /// Resolves the vbucket of `key` and its nodes. `None` for basic buckets
    /// and the empty state.
    #[must_use]
    pub fn route(&self, key: &str) -> Option<Route> {
        let locator = self.locator.as_vbucket()?;
        let vbucket = locator.vbucket(key).clone();
        let master = vbucket.master().and_then(|i| locator.node_at(i));
        let replicas = vbucket
            .replicas()
            .filter_map(|i| locator.node_at(i))
            .collect();
        Some(Route {
            vbucket,
            master,
            replicas,
        })
    }
}

/// Closes nodes on a background task.
pub(crate) fn dispose(nodes: Vec<NodeHandle>) {
    if nodes.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for node in &nodes {
            node.close().await;
        }
        debug!(count = nodes.len(), "closed superseded nodes");
    });
}
