//! `keyroute` Client — vbucket-aware routing, node pool, configuration
//! streaming, retry executor and durability polling.

pub mod config;
pub mod error;
pub mod executor;
pub mod listener;
pub mod locator;
pub mod node;
pub mod observe;
pub mod operation;
pub mod pool;
pub mod registry;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use config::{ClientConfig, HeartbeatConfig};
pub use error::{ClientError, ListenerError, TransportError};
pub use executor::RequestExecutor;
pub use locator::{HashRingLocator, NodeLocator, VBucketLocator};
pub use observe::{DurabilityOutcome, ObserveHandler};
pub use operation::{Operation, OperationKind, OperationResult};
pub use pool::{NodePool, Route};
pub use registry::{Bucket, BucketRegistry, PoolConnector};
pub use traits::{ConfigSource, Node, NodeFactory, NodeHandle};
