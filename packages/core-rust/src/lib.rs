//! `keyroute` Core — cluster configuration model, vbucket map, key hashing,
//! response status taxonomy and durability vocabulary.

pub mod config;
pub mod durability;
pub mod error;
pub mod hash;
pub mod status;
pub mod vbucket;

pub use config::{ClusterConfig, ClusterNode, NodePorts, NodeStatus, VBucketServerMap};
pub use durability::{DurabilityRequirement, ObserveKeyState, PersistTo, ReplicateTo};
pub use error::TopologyError;
pub use hash::HashAlgorithm;
pub use status::ResponseStatus;
pub use vbucket::{VBucket, VBucketMap};
