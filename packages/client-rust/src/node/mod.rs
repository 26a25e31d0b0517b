//! Data nodes: what the pool needs to create one and how a node reports its
//! own failure.
//!
//! - [`protocol`]: binary protocol frames and codec
//! - [`tcp`]: the TCP implementation of [`Node`](crate::traits::Node)
//! - [`NodeSpec`]: everything needed to build a node from a configuration
//! - [`FailureSink`]: channel a node uses to tell the pool it failed

pub mod protocol;
pub mod tcp;

use tokio::sync::mpsc;
use tracing::debug;

use keyroute_core::ClusterNode;

use crate::pool::worker::PoolEvent;

// ---------------------------------------------------------------------------
// NodeSpec
// ---------------------------------------------------------------------------

/// Construction parameters of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// `host:port` of the data port.
    pub endpoint: String,
    pub host: String,
    pub port: u16,
    pub view_base: Option<String>,
    pub bucket: String,
    pub password: Option<String>,
}

impl NodeSpec {
    #[must_use]
    pub fn from_cluster_node(node: &ClusterNode, bucket: &str, password: Option<&str>) -> Self {
        Self {
            endpoint: node.direct_endpoint(),
            host: node.host().to_string(),
            port: node.ports.direct,
            view_base: node.couch_api_base().map(str::to_string),
            bucket: bucket.to_string(),
            password: password.map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// Failure reporting
// ---------------------------------------------------------------------------

/// A node's report that it failed.
///
/// `generation` identifies the pool state the node belongs to, so reports
/// from nodes of a superseded configuration are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub endpoint: String,
    pub generation: u64,
}

/// Sending half of the pool's event channel, stamped with a generation.
#[derive(Debug, Clone)]
pub struct FailureSink {
    tx: Option<mpsc::Sender<PoolEvent>>,
    generation: u64,
}

impl FailureSink {
    pub(crate) fn new(tx: mpsc::Sender<PoolEvent>, generation: u64) -> Self {
        Self {
            tx: Some(tx),
            generation,
        }
    }

    /// A sink that drops every report. For nodes used outside a pool.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            tx: None,
            generation: 0,
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports a failure without waiting. Returns `false` if the report was
    /// dropped (no pool, or the channel is full or closed).
    pub fn report(&self, endpoint: &str) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let failure = NodeFailure {
            endpoint: endpoint.to_string(),
            generation: self.generation,
        };
        match tx.try_send(PoolEvent::NodeFailed(failure)) {
            Ok(()) => true,
            Err(e) => {
                debug!(endpoint, error = %e, "node failure report dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_from_cluster_node() {
        let node: ClusterNode = serde_json::from_str(
            r#"{"hostname": "10.0.0.1:8091", "status": "healthy", "version": "2.0",
                "ports": {"direct": 11210},
                "couchApiBase": "http://10.0.0.1:8092/default"}"#,
        )
        .unwrap();
        let spec = NodeSpec::from_cluster_node(&node, "default", Some("pw"));
        assert_eq!(spec.endpoint, "10.0.0.1:11210");
        assert_eq!(spec.host, "10.0.0.1");
        assert_eq!(spec.port, 11210);
        assert_eq!(
            spec.view_base.as_deref(),
            Some("http://10.0.0.1:8092/default")
        );
        assert_eq!(spec.password.as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn failure_sink_reports_with_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = FailureSink::new(tx, 9);
        assert!(sink.report("10.0.0.1:11210"));

        match rx.recv().await {
            Some(PoolEvent::NodeFailed(failure)) => {
                assert_eq!(failure.endpoint, "10.0.0.1:11210");
                assert_eq!(failure.generation, 9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn detached_sink_drops_reports() {
        assert!(!FailureSink::detached().report("x:1"));
    }
}
