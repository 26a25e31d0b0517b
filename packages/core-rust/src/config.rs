//! Cluster configuration documents as delivered by the management REST API.
//!
//! [`ClusterConfig`] is the bucket configuration pushed over the streaming
//! feed (and piggybacked on not-my-vbucket responses). [`PoolsResponse`],
//! [`PoolDetails`] and [`BucketRef`] are the bootstrap documents walked to
//! find a bucket's streaming URI.
//!
//! Required fields (`name`, `nodes[].hostname`, `status`, `version`,
//! `ports.direct`) are enforced by the schema: a document missing one of
//! them fails to parse instead of producing a half-filled value.

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

// ---------------------------------------------------------------------------
// ClusterConfig
// ---------------------------------------------------------------------------

/// One bucket configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    /// Configuration revision. Older servers omit it, in which case it is 0
    /// and revision ordering is not applied.
    #[serde(default)]
    pub rev: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_uri: Option<String>,
    pub nodes: Vec<ClusterNode>,
    #[serde(
        default,
        rename = "vBucketServerMap",
        skip_serializing_if = "Option::is_none"
    )]
    pub vbucket_server_map: Option<VBucketServerMap>,
    /// `membase`/`couchbase` or `memcached`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_type: Option<String>,
    /// `sasl` when the bucket requires authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl_password: Option<String>,
}

impl ClusterConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Malformed`] when the JSON is invalid or a
    /// required field is missing.
    pub fn from_json(text: &str) -> Result<Self, TopologyError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Parses a configuration document from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Malformed`] on invalid input.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TopologyError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Whether the bucket requires SASL credentials.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        self.auth_type.as_deref() == Some("sasl")
    }

    /// Whether the configuration carries a vbucket map.
    #[must_use]
    pub fn is_vbucket_aware(&self) -> bool {
        self.vbucket_server_map.is_some()
    }

    /// Password to authenticate with: the configuration's SASL password when
    /// the bucket requires auth, otherwise the caller-supplied fallback.
    #[must_use]
    pub fn effective_password<'a>(&'a self, configured: Option<&'a str>) -> Option<&'a str> {
        if self.requires_auth() {
            self.sasl_password.as_deref()
        } else {
            configured
        }
    }

    /// Whether `other` is strictly older than `self`.
    ///
    /// Only meaningful when both sides carry a revision.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        self.rev != 0 && other.rev != 0 && self.rev > other.rev
    }

    /// Whether `other` describes the same topology: bucket name, streaming
    /// URI, each node's hostname, ports and status, and the vbucket map.
    ///
    /// Per-push node statistics (`uptime`, `interestingStats`, ...) and the
    /// revision are not compared.
    #[must_use]
    pub fn same_topology(&self, other: &Self) -> bool {
        self.name == other.name
            && self.streaming_uri == other.streaming_uri
            && self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a.same_topology(b))
            && self.vbucket_server_map == other.vbucket_server_map
    }

    /// Nodes in vbucket server-list order.
    ///
    /// The vbucket map indexes into `serverList`, not into `nodes`, so the
    /// node list used for routing is `serverList` resolved against `nodes` by
    /// `host:direct-port`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::UnknownServer`] when a server-list entry has
    /// no matching node, and [`TopologyError::EmptyVBucketMap`] when the
    /// configuration has no vbucket map at all.
    pub fn vbucket_nodes(&self) -> Result<Vec<&ClusterNode>, TopologyError> {
        let map = self
            .vbucket_server_map
            .as_ref()
            .ok_or(TopologyError::EmptyVBucketMap)?;

        map.server_list
            .iter()
            .map(|spec| {
                self.nodes
                    .iter()
                    .find(|node| node.direct_endpoint() == *spec)
                    .ok_or_else(|| TopologyError::UnknownServer(spec.clone()))
            })
            .collect()
    }

    /// Healthy nodes, used by basic (hash-ring) buckets.
    pub fn healthy_nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(|node| node.is_healthy())
    }

    /// Replaces every `$HOST` placeholder in a raw configuration document.
    ///
    /// Servers emit `$HOST` in configurations they return on a data
    /// connection; the placeholder stands for the host that was contacted.
    #[must_use]
    pub fn substitute_host(raw: &str, host: &str) -> String {
        raw.replace("$HOST", host)
    }
}

// ---------------------------------------------------------------------------
// ClusterNode
// ---------------------------------------------------------------------------

/// Health reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    Warmup,
    #[serde(other)]
    Unknown,
}

/// Ports advertised by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    /// Data (binary protocol) port.
    pub direct: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<u16>,
}

/// One physical server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Host as advertised, usually with the management port (`host:8091`).
    pub hostname: String,
    pub status: NodeStatus,
    pub version: String,
    pub ports: NodePorts,
    /// Everything else the server sent about the node (`couchApiBase`,
    /// `uptime`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClusterNode {
    /// Host with the management port stripped. IPv6 literals keep their
    /// brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        strip_port(&self.hostname)
    }

    /// `host:direct`, the form used in a vbucket server list.
    #[must_use]
    pub fn direct_endpoint(&self) -> String {
        format!("{}:{}", self.host(), self.ports.direct)
    }

    /// Same hostname, ports and status.
    #[must_use]
    pub fn same_topology(&self, other: &Self) -> bool {
        self.hostname == other.hostname && self.ports == other.ports && self.status == other.status
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }

    /// Base URI of the node's view API, if it advertises one.
    #[must_use]
    pub fn couch_api_base(&self) -> Option<&str> {
        self.extra
            .get("couchApiBase")
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

fn strip_port(hostname: &str) -> &str {
    if hostname.starts_with('[') {
        return match hostname.find(']') {
            Some(end) => &hostname[..=end],
            None => hostname,
        };
    }
    // A bare IPv6 literal has several colons and no port.
    match (hostname.find(':'), hostname.rfind(':')) {
        (Some(first), Some(last)) if first == last && first > 0 => &hostname[..first],
        _ => hostname,
    }
}

// ---------------------------------------------------------------------------
// VBucketServerMap
// ---------------------------------------------------------------------------

/// The raw vbucket map section of a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketServerMap {
    pub hash_algorithm: String,
    pub num_replicas: usize,
    pub server_list: Vec<String>,
    /// `[master, replica1, replica2, ...]` per vbucket; `-1` means no server.
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

// ---------------------------------------------------------------------------
// Bootstrap documents
// ---------------------------------------------------------------------------

/// Response of `GET /pools`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolsResponse {
    #[serde(default)]
    pub pools: Option<Vec<PoolRef>>,
}

impl PoolsResponse {
    /// Parses the document and returns its first pool.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::MissingElement`] when `pools` is absent or
    /// empty, and [`TopologyError::Malformed`] on invalid JSON.
    pub fn first_pool(text: &str) -> Result<PoolRef, TopologyError> {
        let response: Self = serde_json::from_str(text)?;
        let pools = response
            .pools
            .ok_or(TopologyError::MissingElement("pools"))?;
        pools
            .into_iter()
            .next()
            .ok_or(TopologyError::EmptyElement("pools"))
    }
}

/// Entry of the `pools` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub streaming_uri: Option<String>,
}

/// Response of `GET /pools/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDetails {
    pub buckets: BucketsLink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketsLink {
    pub uri: String,
}

/// Entry of the bucket list returned by `buckets.uri`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketRef {
    pub name: String,
    #[serde(default)]
    pub uri: Option<String>,
    pub streaming_uri: String,
}

impl BucketRef {
    /// Finds a bucket's streaming URI in a bucket list document.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::BucketNotFound`] when no entry has the name.
    pub fn find_streaming_uri(text: &str, bucket: &str) -> Result<String, TopologyError> {
        let buckets: Vec<Self> = serde_json::from_str(text)?;
        buckets
            .into_iter()
            .find(|b| b.name == bucket)
            .map(|b| b.streaming_uri)
            .ok_or_else(|| TopologyError::BucketNotFound(bucket.to_string()))
    }
}
