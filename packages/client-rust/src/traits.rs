use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::{ListenerError, TransportError};
use crate::node::protocol::{ObserveResult, Request, Response};
use crate::node::{FailureSink, NodeSpec};

/// Shared handle to a data node.
pub type NodeHandle = Arc<dyn Node>;

/// One data server connection.
/// Implementations: TCP binary protocol, in-memory mocks (tests).
#[async_trait]
pub trait Node: Send + Sync + fmt::Debug {
    /// `host:port` of the data port.
    fn endpoint(&self) -> &str;

    /// Host part of the endpoint.
    fn host(&self) -> &str;

    /// Base URI of the node's view API, if the cluster advertised one.
    fn view_base(&self) -> Option<&str>;

    /// `false` once a transport failure marked the node dead and until a
    /// successful `ping` revives it.
    fn is_alive(&self) -> bool;

    /// Tries to reach the node and revives it on success.
    async fn ping(&self) -> bool;

    /// Sends one request and waits for its response.
    async fn execute(&self, request: Request) -> Result<Response, TransportError>;

    /// Asks the node for the state of a key in a vbucket.
    async fn observe(&self, key: &str, vbucket: u16) -> Result<ObserveResult, TransportError>;

    /// Closes the connection. The node is unusable afterwards.
    async fn close(&self);
}

/// Creates nodes for a configuration. The pool calls this for every node of
/// every applied configuration.
pub trait NodeFactory: Send + Sync {
    /// Builds a node. Connecting may be deferred to the first request.
    fn create(&self, spec: NodeSpec, failures: FailureSink) -> Result<NodeHandle, TransportError>;
}

/// Chunked configuration stream as delivered by a [`ConfigSource`].
pub type ConfigChunks = BoxStream<'static, Result<Bytes, ListenerError>>;

/// Where cluster configurations come from.
/// Implementations: management REST API over HTTP, scripted sources (tests).
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Resolves a bootstrap URI to the bucket's streaming URI.
    async fn resolve(&self, bootstrap_uri: &str) -> Result<String, ListenerError>;

    /// Opens the chunked configuration stream.
    async fn open_stream(&self, streaming_uri: &str) -> Result<ConfigChunks, ListenerError>;

    /// Heartbeat probe. Any error aborts the current stream.
    async fn probe(&self, uri: &str) -> Result<(), ListenerError>;
}
