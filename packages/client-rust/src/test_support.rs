//! In-memory cluster used by the unit tests.
//!
//! A [`MockServer`] stands for one data server and outlives reconfigurations;
//! every [`MockNode`] built for its endpoint shares it, the same way real
//! node objects share a physical server. Handlers decide what each request
//! returns.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use keyroute_core::{ClusterConfig, ObserveKeyState, ResponseStatus};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::error::{ListenerError, TransportError};
use crate::node::protocol::{ObserveResult, Request, Response};
use crate::node::{FailureSink, NodeSpec};
use crate::traits::{ConfigChunks, ConfigSource, Node, NodeFactory, NodeHandle};

pub(crate) type RequestHandler =
    Arc<dyn Fn(&Request) -> Result<Response, TransportError> + Send + Sync>;
pub(crate) type ObserveFn =
    Arc<dyn Fn(&str, u16) -> Result<ObserveResult, TransportError> + Send + Sync>;

// ---------------------------------------------------------------------------
// MockServer
// ---------------------------------------------------------------------------

pub(crate) struct MockServer {
    pub endpoint: String,
    handler: RwLock<RequestHandler>,
    observer: RwLock<ObserveFn>,
    requests: AtomicUsize,
    observes: AtomicUsize,
    pings: AtomicUsize,
    ping_ok: AtomicBool,
    ping_delay: Mutex<std::time::Duration>,
}

impl MockServer {
    pub fn new(endpoint: &str) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.to_string(),
            handler: RwLock::new(Arc::new(|_| {
                Ok(Response::new(ResponseStatus::Success).with_cas(1))
            })),
            observer: RwLock::new(Arc::new(|_, _| {
                Ok(ObserveResult {
                    key_state: ObserveKeyState::FoundPersisted,
                    cas: 1,
                })
            })),
            requests: AtomicUsize::new(0),
            observes: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            ping_ok: AtomicBool::new(true),
            ping_delay: Mutex::new(std::time::Duration::ZERO),
        })
    }

    pub fn set_handler(
        &self,
        handler: impl Fn(&Request) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) {
        *self.handler.write() = Arc::new(handler);
    }

    pub fn set_observer(
        &self,
        observer: impl Fn(&str, u16) -> Result<ObserveResult, TransportError> + Send + Sync + 'static,
    ) {
        *self.observer.write() = Arc::new(observer);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: std::time::Duration) {
        *self.ping_delay.lock() = delay;
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn observe_count(&self) -> usize {
        self.observes.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MockNode
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct MockNode {
    spec: NodeSpec,
    server: Arc<MockServer>,
    alive: AtomicBool,
    closed: AtomicBool,
    failures: FailureSink,
}

impl MockNode {
    pub fn new(spec: NodeSpec, server: Arc<MockServer>, failures: FailureSink) -> Arc<Self> {
        Arc::new(Self {
            spec,
            server,
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            failures,
        })
    }

    /// A node with its own server, outside any pool.
    pub fn standalone(endpoint: &str) -> Arc<Self> {
        Self::new(
            spec_for(endpoint),
            MockServer::new(endpoint),
            FailureSink::detached(),
        )
    }

    pub fn server(&self) -> &Arc<MockServer> {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the node dead and reports it, as a transport failure would.
    pub fn kill(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.failures.report(&self.spec.endpoint);
        }
    }
}

#[async_trait]
impl Node for MockNode {
    fn endpoint(&self) -> &str {
        &self.spec.endpoint
    }

    fn host(&self) -> &str {
        &self.spec.host
    }

    fn view_base(&self) -> Option<&str> {
        self.spec.view_base.as_deref()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> bool {
        self.server.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.server.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let ok = self.server.ping_ok.load(Ordering::SeqCst) && !self.is_closed();
        if ok {
            self.alive.store(true, Ordering::SeqCst);
        }
        ok
    }

    async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::NodeDead {
                endpoint: self.spec.endpoint.clone(),
            });
        }
        self.server.requests.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::clone(&self.server.handler.read());
        let result = handler(&request);
        if result.is_err() {
            self.kill();
        }
        result
    }

    async fn observe(&self, key: &str, vbucket: u16) -> Result<ObserveResult, TransportError> {
        self.server.observes.fetch_add(1, Ordering::SeqCst);
        let observer = Arc::clone(&self.server.observer.read());
        observer(key, vbucket)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockNodeFactory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct MockNodeFactory {
    servers: DashMap<String, Arc<MockServer>>,
    nodes: Mutex<Vec<Arc<MockNode>>>,
}

impl MockNodeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The server behind an endpoint, created on first use.
    pub fn server(&self, endpoint: &str) -> Arc<MockServer> {
        self.servers
            .entry(endpoint.to_string())
            .or_insert_with(|| MockServer::new(endpoint))
            .clone()
    }

    /// Most recently created node for an endpoint.
    pub fn node(&self, endpoint: &str) -> Option<Arc<MockNode>> {
        self.nodes
            .lock()
            .iter()
            .rev()
            .find(|n| n.spec.endpoint == endpoint)
            .cloned()
    }

    pub fn created(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn all_nodes(&self) -> Vec<Arc<MockNode>> {
        self.nodes.lock().clone()
    }
}

impl NodeFactory for MockNodeFactory {
    fn create(&self, spec: NodeSpec, failures: FailureSink) -> Result<NodeHandle, TransportError> {
        let node = MockNode::new(spec.clone(), self.server(&spec.endpoint), failures);
        self.nodes.lock().push(Arc::clone(&node));
        Ok(node)
    }
}

// ---------------------------------------------------------------------------
// Configurations
// ---------------------------------------------------------------------------

/// Data endpoint of server `index` in the generated configurations.
pub(crate) fn endpoint(index: usize) -> String {
    format!("10.0.0.{}:11210", index + 1)
}

fn spec_for(endpoint: &str) -> NodeSpec {
    let (host, port) = endpoint.rsplit_once(':').unwrap_or((endpoint, "11210"));
    NodeSpec {
        endpoint: endpoint.to_string(),
        host: host.to_string(),
        port: port.parse().unwrap_or(11210),
        view_base: None,
        bucket: "default".to_string(),
        password: None,
    }
}

fn node_json(index: usize) -> serde_json::Value {
    json!({
        "hostname": format!("10.0.0.{}:8091", index + 1),
        "status": "healthy",
        "version": "2.0.0",
        "ports": {"direct": 11210, "proxy": 11211},
        "couchApiBase": format!("http://10.0.0.{}:8092/default", index + 1),
    })
}

/// Vbucket entries where vbucket `v` lives on server `v % servers` with
/// replicas on the following servers.
pub(crate) fn rotating_map(servers: usize, vbuckets: usize, replicas: usize) -> Vec<Vec<i32>> {
    (0..vbuckets)
        .map(|v| {
            (0..=replicas)
                .map(|r| i32::try_from((v + r) % servers).unwrap())
                .collect()
        })
        .collect()
}

pub(crate) fn vbucket_config_with(
    servers: usize,
    replicas: usize,
    rev: u64,
    map: Vec<Vec<i32>>,
) -> ClusterConfig {
    let value = json!({
        "name": "default",
        "rev": rev,
        "bucketType": "membase",
        "nodes": (0..servers).map(node_json).collect::<Vec<_>>(),
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": replicas,
            "serverList": (0..servers).map(endpoint).collect::<Vec<_>>(),
            "vBucketMap": map,
        },
    });
    serde_json::from_value(value).unwrap()
}

pub(crate) fn vbucket_config(servers: usize, vbuckets: usize, replicas: usize) -> ClusterConfig {
    vbucket_config_with(servers, replicas, 1, rotating_map(servers, vbuckets, replicas))
}

pub(crate) fn basic_config(servers: usize) -> ClusterConfig {
    let value = json!({
        "name": "cache",
        "bucketType": "memcached",
        "nodes": (0..servers).map(node_json).collect::<Vec<_>>(),
    });
    serde_json::from_value(value).unwrap()
}

// ---------------------------------------------------------------------------
// ScriptedSource
// ---------------------------------------------------------------------------

/// What one `open_stream` call yields.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Chunks, then the stream stays open.
    Open(Vec<Bytes>),
    /// Chunks, then the server closes the stream.
    Closed(Vec<Bytes>),
    /// Connecting fails.
    Refused,
}

/// Configuration source driven by a queue of scripts. Once the queue is
/// empty every stream stays open and silent.
#[derive(Debug, Default)]
pub(crate) struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    unresolvable: Mutex<Vec<String>>,
    opened: Mutex<Vec<String>>,
    resolves: AtomicUsize,
    probe_ok: AtomicBool,
}

impl ScriptedSource {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            probe_ok: AtomicBool::new(true),
            ..Self::default()
        })
    }

    pub fn fail_resolve(&self, uri: &str) {
        self.unresolvable.lock().push(uri.to_string());
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Streaming URIs opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for ScriptedSource {
    async fn resolve(&self, bootstrap_uri: &str) -> Result<String, ListenerError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        if self.unresolvable.lock().iter().any(|u| u == bootstrap_uri) {
            return Err(ListenerError::Status {
                uri: bootstrap_uri.to_string(),
                status: 503,
            });
        }
        Ok(format!("{bootstrap_uri}/stream"))
    }

    async fn open_stream(&self, streaming_uri: &str) -> Result<ConfigChunks, ListenerError> {
        self.opened.lock().push(streaming_uri.to_string());
        let script = self.scripts.lock().pop_front();
        match script {
            Some(Script::Open(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            Some(Script::Closed(chunks)) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            Some(Script::Refused) => Err(ListenerError::Status {
                uri: streaming_uri.to_string(),
                status: 502,
            }),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn probe(&self, uri: &str) -> Result<(), ListenerError> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ListenerError::HeartbeatFailed(uri.to_string()))
        }
    }
}

/// Frames a configuration the way the streaming endpoint does.
pub(crate) fn framed(config: &ClusterConfig) -> Bytes {
    let mut text = serde_json::to_string(config).unwrap();
    text.push_str("\n\n\n\n");
    Bytes::from(text)
}
