//! Errors raised while parsing and validating cluster topology.

/// Errors from decoding a cluster configuration or building a vbucket map.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("malformed cluster configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported hash algorithm: {0}")]
    UnsupportedHashAlgorithm(String),
    #[error("vbucket map is empty")]
    EmptyVBucketMap,
    #[error("server sent an empty vbucket definition at index {index}")]
    EmptyVBucketEntry { index: usize },
    #[error("vbucket {index} references server {server} but only {servers} are listed")]
    ServerIndexOutOfRange {
        index: usize,
        server: i32,
        servers: usize,
    },
    #[error("vbucket count {0} exceeds the 16-bit vbucket id space")]
    TooManyVBuckets(usize),
    #[error("vbucket map contains server {0} which is not in the node list")]
    UnknownServer(String),
    #[error("{0} element was not found in the bootstrap response")]
    MissingElement(&'static str),
    #[error("{0} element was empty in the bootstrap response")]
    EmptyElement(&'static str),
    #[error("bucket '{0}' was not found")]
    BucketNotFound(String),
}
