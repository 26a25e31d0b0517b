//! Pool reconciliation worker.
//!
//! Configuration events from the listener and failure reports from nodes
//! all arrive on one channel and are applied to the pool one at a time.
//! Nodes never call into the pool directly.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{NodePool, PoolInner};
use crate::listener::ConfigEvent;
use crate::node::NodeFailure;

/// Capacity of the worker channel.
pub const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Everything the pool reacts to.
#[derive(Debug)]
pub enum PoolEvent {
    Config(ConfigEvent),
    NodeFailed(NodeFailure),
}

impl From<ConfigEvent> for PoolEvent {
    fn from(event: ConfigEvent) -> Self {
        Self::Config(event)
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Applies [`PoolEvent`]s to the pool.
///
/// Holds the pool weakly so a dropped pool also ends the worker's work.
pub(crate) struct Reconciler {
    pool: Weak<PoolInner>,
}

impl Reconciler {
    pub(crate) fn new(pool: Weak<PoolInner>) -> Self {
        Self { pool }
    }

    fn pool(&self) -> Option<NodePool> {
        self.pool.upgrade().map(NodePool::from_inner)
    }

    async fn apply(&self, event: PoolEvent) {
        let Some(pool) = self.pool() else {
            return;
        };
        match event {
            PoolEvent::Config(ConfigEvent::Updated(config)) => pool.reconfigure(Some(*config)).await,
            PoolEvent::Config(ConfigEvent::Empty) => pool.reconfigure(None).await,
            PoolEvent::NodeFailed(failure) => {
                pool.node_failed(&failure.endpoint, failure.generation).await;
            }
        }
    }

    fn report_alive_nodes(&self) {
        if let Some(pool) = self.pool() {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!("keyroute_alive_nodes").set(pool.working_nodes().len() as f64);
        }
    }
}

// ---------------------------------------------------------------------------
// ReconcileWorker
// ---------------------------------------------------------------------------

/// The spawned task running a [`Reconciler`]. Also refreshes the alive-node
/// gauge every `gauge_interval`.
pub(crate) struct ReconcileWorker {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReconcileWorker {
    /// Starts the worker and returns the sender producers feed it through.
    /// Must be called from within a Tokio runtime.
    pub(crate) fn start(
        reconciler: Reconciler,
        gauge_interval: Duration,
    ) -> (Self, mpsc::Sender<PoolEvent>) {
        let (tx, mut rx) = mpsc::channel::<PoolEvent>(EVENT_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut gauge = tokio::time::interval(gauge_interval);
            gauge.tick().await;

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => reconciler.apply(event).await,
                        None => break,
                    },
                    _ = gauge.tick() => reconciler.report_alive_nodes(),
                    _ = &mut shutdown_rx => break,
                }
            }
            debug!("pool reconciler stopped");
        });

        let worker = Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        };
        (worker, tx)
    }

    /// Stops the worker and waits for its task to finish. Idempotent.
    pub(crate) async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
