//! The node pool: the live set of nodes and the locator that routes keys to
//! them.
//!
//! Readers load an immutable [`InternalState`] snapshot through `ArcSwap` and
//! never lock. Writers (reconfiguration, node failure handling, resurrection)
//! serialize on one async mutex and publish a complete new snapshot. Nodes of
//! a superseded snapshot are closed on a background task.
//!
//! - [`state`]: snapshot, operation factory, routes
//! - [`worker`]: the reconciliation worker that applies pool events
//! - `resurrect`: the dead-node ping timer

mod resurrect;
pub mod state;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use keyroute_core::ClusterConfig;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

pub use state::{InternalState, OperationFactory, Route};
pub use worker::PoolEvent;

use self::state::dispose;
use self::worker::{ReconcileWorker, Reconciler};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::listener::{self, HttpConfigSource, ListenerHandle};
use crate::node::tcp::TcpNodeFactory;
use crate::node::NodeFailure;
use crate::traits::{ConfigSource, NodeFactory, NodeHandle};

/// Capacity of the node-failure broadcast.
const FAILURE_BROADCAST_CAPACITY: usize = 64;

pub(crate) struct PoolInner {
    config: ClientConfig,
    factory: Arc<dyn NodeFactory>,
    state: ArcSwap<InternalState>,
    reconfigure_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    events: mpsc::Sender<PoolEvent>,
    worker: parking_lot::Mutex<Option<ReconcileWorker>>,
    listener: parking_lot::Mutex<Option<ListenerHandle>>,
    resurrection: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    ready: watch::Sender<bool>,
    failures: broadcast::Sender<NodeFailure>,
    shut_down: AtomicBool,
}

/// Shared handle to a node pool. Cheap to clone.
#[derive(Clone)]
pub struct NodePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.load();
        f.debug_struct("NodePool")
            .field("bucket", &self.inner.config.bucket)
            .field("generation", &state.generation())
            .field("nodes", &state.nodes().len())
            .finish_non_exhaustive()
    }
}

impl NodePool {
    /// Creates an unconfigured pool and its reconciliation worker. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn new(config: ClientConfig, factory: Arc<dyn NodeFactory>) -> Result<Self, ClientError> {
        config.validate()?;
        let tick = config.dead_timeout();
        let (ready, _) = watch::channel(false);
        let (failures, _) = broadcast::channel(FAILURE_BROADCAST_CAPACITY);

        let inner = Arc::new_cyclic(|weak| {
            let (worker, events) = ReconcileWorker::start(Reconciler::new(weak.clone()), tick);
            PoolInner {
                config,
                factory,
                state: ArcSwap::from_pointee(InternalState::empty(0)),
                reconfigure_lock: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                events,
                worker: parking_lot::Mutex::new(Some(worker)),
                listener: parking_lot::Mutex::new(None),
                resurrection: parking_lot::Mutex::new(None),
                ready,
                failures,
                shut_down: AtomicBool::new(false),
            }
        });
        Ok(Self { inner })
    }

    /// Creates a pool over TCP nodes, bootstraps it over HTTP and waits for
    /// the first configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration, when the HTTP client
    /// cannot be built, or when no configuration arrives in time.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let source = Arc::new(HttpConfigSource::new(&config)?);
        let factory = Arc::new(TcpNodeFactory::new(config.send_timeout()));
        let pool = Self::new(config, factory)?;
        if let Err(e) = pool.start(source).await {
            pool.shutdown().await;
            return Err(e);
        }
        Ok(pool)
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        Self { inner }
    }

    /// Starts the configuration listener and waits until a configuration has
    /// been applied. Calling it again only waits.
    ///
    /// # Errors
    ///
    /// [`ClientError::BootstrapTimeout`] when no configuration is applied
    /// within the bootstrap timeout, [`ClientError::ShutDown`] after
    /// [`shutdown`](Self::shutdown).
    pub async fn start(&self, source: Arc<dyn ConfigSource>) -> Result<(), ClientError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ClientError::ShutDown);
        }
        {
            let mut listener = self.inner.listener.lock();
            if listener.is_none() {
                *listener = Some(listener::spawn(
                    self.inner.config.clone(),
                    source,
                    self.inner.events.clone(),
                ));
            }
        }
        self.wait_ready(self.inner.config.bootstrap_timeout()).await
    }

    /// Waits until a configuration has been applied.
    ///
    /// # Errors
    ///
    /// [`ClientError::BootstrapTimeout`] when `timeout` elapses first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut ready = self.inner.ready.subscribe();
        let waited = tokio::time::timeout(timeout, ready.wait_for(|ready| *ready))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ShutDown),
            Err(_) => Err(ClientError::BootstrapTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    // -- read path ----------------------------------------------------------

    /// Current snapshot. Everything read from it is mutually consistent.
    #[must_use]
    pub fn snapshot(&self) -> Arc<InternalState> {
        self.inner.state.load_full()
    }

    #[must_use]
    pub fn locate(&self, key: &str) -> Option<NodeHandle> {
        self.inner.state.load().locator().locate(key)
    }

    #[must_use]
    pub fn working_nodes(&self) -> Vec<NodeHandle> {
        self.inner.state.load().locator().working_nodes()
    }

    /// All nodes of the current snapshot, dead or alive.
    #[must_use]
    pub fn current_nodes(&self) -> Vec<NodeHandle> {
        self.inner.state.load().nodes().to_vec()
    }

    #[must_use]
    pub fn route(&self, key: &str) -> Option<Route> {
        self.inner.state.load().route(key)
    }

    #[must_use]
    pub fn operation_factory(&self) -> OperationFactory {
        self.inner.state.load().operation_factory().clone()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Node failures accepted by the pool, for diagnostics.
    #[must_use]
    pub fn failures(&self) -> broadcast::Receiver<NodeFailure> {
        self.inner.failures.subscribe()
    }

    /// Sender into the reconciliation worker.
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<PoolEvent> {
        self.inner.events.clone()
    }

    // -- write path ---------------------------------------------------------

    /// Applies a configuration.
    ///
    /// `None` keeps the current state, as does a configuration older than the
    /// active one or one with the same topology. Otherwise a new snapshot is built and
    /// swapped in; if building fails the pool switches to the empty state.
    pub async fn reconfigure(&self, config: Option<ClusterConfig>) {
        let inner = &self.inner;
        let _guard = inner.reconfigure_lock.lock().await;
        if inner.shut_down.load(Ordering::Acquire) {
            return;
        }

        let Some(config) = config else {
            debug!("empty configuration, keeping current state");
            return;
        };

        let current = inner.state.load_full();
        if let Some(active) = current.config() {
            if active.same_topology(&config) {
                debug!(rev = config.rev, "configuration unchanged");
                return;
            }
            if active.supersedes(&config) {
                debug!(active = active.rev, received = config.rev, "ignoring stale configuration");
                return;
            }
        }

        resurrect::disarm(inner);
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = match InternalState::build(
            config,
            generation,
            inner.factory.as_ref(),
            &inner.config.bucket,
            inner.config.bucket_password.as_deref(),
            &inner.events,
        ) {
            Ok(state) => {
                info!(
                    generation,
                    nodes = state.nodes().len(),
                    vbucket_aware = state.is_vbucket_aware(),
                    "pool reconfigured"
                );
                metrics::counter!("keyroute_reconfigurations_total").increment(1);
                state
            }
            Err(e) => {
                error!(generation, error = %e, "reconfiguration failed, pool is now empty");
                metrics::counter!("keyroute_reconfiguration_failures_total").increment(1);
                InternalState::empty(generation)
            }
        };

        let applied = !next.is_empty();
        let previous = inner.state.swap(Arc::new(next));
        dispose(previous.nodes().to_vec());
        if applied {
            inner.ready.send_replace(true);
        }
    }

    /// Handles a node's failure report.
    ///
    /// Reports from another generation or against the empty state are
    /// ignored. A hash ring is rebuilt without the dead node; a vbucket
    /// locator is left alone until the cluster sends a new map.
    pub async fn node_failed(&self, endpoint: &str, generation: u64) {
        let _guard = self.inner.reconfigure_lock.lock().await;
        let state = self.inner.state.load_full();
        if state.is_empty() || state.generation() != generation {
            debug!(endpoint, generation, "ignoring failure of a superseded node");
            return;
        }

        warn!(endpoint, generation, "node failed");
        metrics::counter!("keyroute_node_failures_total").increment(1);
        let _ = self.inner.failures.send(NodeFailure {
            endpoint: endpoint.to_string(),
            generation,
        });

        if !state.is_vbucket_aware() {
            self.inner.state.store(Arc::new(state.with_rebuilt_ring()));
        }
        resurrect::arm(&self.inner);
    }

    /// One resurrection pass. Returns whether dead nodes remain.
    ///
    /// Pings run without the reconfigure lock; the ring is only rebuilt if
    /// the state they were taken from is still current.
    pub(crate) async fn resurrect_dead_nodes(&self) -> bool {
        let state = self.inner.state.load_full();
        if state.is_empty() {
            return false;
        }
        let dead: Vec<NodeHandle> = state
            .nodes()
            .iter()
            .filter(|node| !node.is_alive())
            .cloned()
            .collect();
        if dead.is_empty() {
            return false;
        }

        let mut revived = 0_u64;
        for node in &dead {
            if node.ping().await {
                info!(endpoint = node.endpoint(), "node resurrected");
                revived += 1;
            }
        }

        let _guard = self.inner.reconfigure_lock.lock().await;
        let current = self.inner.state.load_full();
        if current.is_empty() || current.generation() != state.generation() {
            debug!(generation = state.generation(), "state replaced during resurrection pass");
            return false;
        }
        if revived > 0 {
            metrics::counter!("keyroute_node_resurrections_total").increment(revived);
            if !current.is_vbucket_aware() {
                self.inner.state.store(Arc::new(current.with_rebuilt_ring()));
            }
        }
        current.nodes().iter().any(|node| !node.is_alive())
    }

    #[must_use]
    pub fn resurrection_armed(&self) -> bool {
        resurrect::is_armed(&self.inner)
    }

    /// Stops the listener, the worker and the resurrection timer, then closes
    /// every node. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let listener = self.inner.listener.lock().take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
        resurrect::disarm(&self.inner);
        let worker = self.inner.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }

        let _guard = self.inner.reconfigure_lock.lock().await;
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = self.inner.state.swap(Arc::new(InternalState::empty(generation)));
        for node in previous.nodes() {
            node.close().await;
        }
        info!(bucket = %self.inner.config.bucket, "node pool shut down");
    }
}
