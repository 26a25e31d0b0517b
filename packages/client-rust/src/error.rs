//! Error types of the client.
//!
//! Setup and lifecycle failures are returned as [`ClientError`]. Per-attempt
//! wire failures are [`TransportError`] values that travel inside operation
//! results. The streaming listener reports [`ListenerError`] internally and
//! never surfaces it to operation callers.

use keyroute_core::TopologyError;

/// Fatal or setup-time errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no bootstrap URIs configured")]
    NoBootstrapUris,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error("no cluster configuration received within {timeout_ms}ms")]
    BootstrapTimeout { timeout_ms: u64 },
    #[error("the node pool has been shut down")]
    ShutDown,
    #[error("bucket '{0}' is not open")]
    BucketNotOpen(String),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("could not create node: {0}")]
    Transport(#[from] TransportError),
}

/// Failure of a single attempt on a data connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error talking to {endpoint}: {message}")]
    Io { endpoint: String, message: String },
    #[error("attempt on {endpoint} timed out after {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },
    #[error("connection to {endpoint} closed")]
    ConnectionClosed { endpoint: String },
    #[error("node {endpoint} is marked dead")]
    NodeDead { endpoint: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Wraps an I/O error with the endpoint it happened on.
    #[must_use]
    pub fn io(endpoint: &str, err: &std::io::Error) -> Self {
        Self::Io {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}

/// Failures inside the configuration stream listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {uri}")]
    Status { uri: String, status: u16 },
    #[error("invalid uri '{0}'")]
    InvalidUri(String),
    #[error(transparent)]
    Bootstrap(#[from] TopologyError),
    #[error("remote host closed the streaming connection")]
    StreamClosed,
    #[error("heartbeat to {0} failed")]
    HeartbeatFailed(String),
}
