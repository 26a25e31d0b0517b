//! Sending operations: routing, not-my-vbucket redirects, retries and
//! durability.
//!
//! Each attempt routes through the current pool snapshot. A not-my-vbucket
//! response feeds the configuration it carries back into the pool before the
//! next attempt, so the retry already uses the new map.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use keyroute_core::{ClusterConfig, DurabilityRequirement, ResponseStatus};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::node::protocol::StoreMode;
use crate::observe::{DurabilityOutcome, ObserveHandler};
use crate::operation::{Operation, OperationKind, OperationResult};
use crate::pool::NodePool;
use crate::traits::Node;

/// Cap on the exponent of the backoff between attempts.
const MAX_BACKOFF_SHIFT: u32 = 6;

enum Attempt {
    Done(OperationResult),
    Retry(OperationResult),
}

/// Sends operations against a [`NodePool`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    pool: NodePool,
    observer: ObserveHandler,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(pool: NodePool) -> Self {
        let config = pool.config();
        let observer = ObserveHandler::new(pool.clone(), config.observe_interval(), config.observe_timeout());
        Self { pool, observer }
    }

    #[must_use]
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// An operation carrying the configured retry and lifespan budgets.
    #[must_use]
    pub fn operation(&self, key: impl Into<String>, kind: OperationKind) -> Operation {
        let config = self.pool.config();
        Operation::new(key, kind)
            .with_max_retries(config.max_retries)
            .with_lifespan(config.operation_lifespan())
    }

    // -- retry loop ---------------------------------------------------------

    /// Sends `op`, retrying topology changes and safe transport failures.
    ///
    /// At most `max_retries + 1` attempts are made. When they are used up the
    /// last failure is returned as is; an operation-timeout result is only
    /// produced once the operation's lifespan has elapsed.
    pub async fn send_with_retry(&self, mut op: Operation) -> OperationResult {
        let deadline = op.deadline();
        loop {
            if Instant::now() >= deadline {
                return OperationResult::timed_out(op.attempts());
            }
            let attempt = op.record_attempt();
            let outcome = match timeout_at(deadline, self.send_once(&op, attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => return OperationResult::timed_out(attempt),
            };

            match outcome {
                Attempt::Done(result) => return result,
                Attempt::Retry(result) if attempt > op.max_retries() => {
                    debug!(key = op.key(), attempts = attempt, status = %result.status, "retries exhausted");
                    return result;
                }
                Attempt::Retry(result) => {
                    debug!(key = op.key(), attempt, status = %result.status, "retrying operation");
                    metrics::counter!("keyroute_retries_total").increment(1);
                    let backoff = Duration::from_millis(1 << attempt.min(MAX_BACKOFF_SHIFT));
                    sleep_until((Instant::now() + backoff).min(deadline)).await;
                }
            }
        }
    }

    async fn send_once(&self, op: &Operation, attempt: u32) -> Attempt {
        let state = self.pool.snapshot();
        let Some(node) = state.locator().locate(op.key()) else {
            return Attempt::Done(OperationResult::failure(
                ResponseStatus::NodeUnavailable,
                "No server is available to handle the key",
                attempt,
            ));
        };
        let vbucket = state.operation_factory().vbucket_for(op.key());

        match node.execute(op.request(vbucket)).await {
            Ok(response) if response.status.is_not_my_vbucket() => {
                metrics::counter!("keyroute_not_my_vbucket_total").increment(1);
                debug!(key = op.key(), vbucket, endpoint = node.endpoint(), "not my vbucket");
                self.apply_piggybacked_config(node.as_ref(), &response.value).await;
                Attempt::Retry(OperationResult::from_response(response, attempt))
            }
            Ok(response) => Attempt::Done(OperationResult::from_response(response, attempt)),
            Err(e) if op.retries_transport_failures() => {
                debug!(key = op.key(), endpoint = node.endpoint(), error = %e, "transport failure");
                Attempt::Retry(OperationResult::transport(e, attempt))
            }
            Err(e) => {
                warn!(key = op.key(), endpoint = node.endpoint(), error = %e, "transport failure on unguarded mutation");
                Attempt::Done(OperationResult::transport(e, attempt))
            }
        }
    }

    /// Parses the configuration a not-my-vbucket response may carry and
    /// hands it to the pool.
    async fn apply_piggybacked_config(&self, node: &dyn Node, body: &Bytes) {
        if body.is_empty() {
            return;
        }
        let Ok(raw) = std::str::from_utf8(body) else {
            debug!(endpoint = node.endpoint(), "not-my-vbucket body is not utf-8");
            return;
        };
        match ClusterConfig::from_json(&ClusterConfig::substitute_host(raw, node.host())) {
            Ok(config) => self.pool.reconfigure(Some(config)).await,
            Err(e) => debug!(endpoint = node.endpoint(), error = %e, "ignoring unparsable piggybacked config"),
        }
    }

    /// [`send_with_retry`](Self::send_with_retry) on a spawned task.
    #[must_use]
    pub fn send_with_retry_async(&self, op: Operation) -> JoinHandle<OperationResult> {
        let executor = self.clone();
        tokio::spawn(async move { executor.send_with_retry(op).await })
    }

    /// Like [`send_with_retry`](Self::send_with_retry), but gives up as soon
    /// as `token` is cancelled.
    pub async fn send_with_retry_cancellable(&self, op: Operation, token: &CancellationToken) -> OperationResult {
        tokio::select! {
            biased;
            () = token.cancelled() => OperationResult::failure(
                ResponseStatus::ClientFailure,
                "The operation was cancelled.",
                0,
            ),
            result = self.send_with_retry(op) => result,
        }
    }

    // -- durability ---------------------------------------------------------

    /// Sends a mutation and waits until `requirement` is met.
    ///
    /// Requirements the topology cannot meet fail before anything is sent.
    pub async fn send_with_durability(
        &self,
        op: Operation,
        is_delete: bool,
        requirement: DurabilityRequirement,
    ) -> OperationResult {
        if requirement.is_none() {
            return self.send_with_retry(op).await;
        }
        let key = op.key().to_string();
        if let Err(outcome) = self.observer.precheck(&key, requirement) {
            let status = if self.pool.snapshot().is_empty() {
                ResponseStatus::NodeUnavailable
            } else {
                ResponseStatus::DurabilityExpectationExceeded
            };
            return OperationResult::failure(status, outcome_message(&outcome), 0);
        }

        let result = self.send_with_retry(op).await;
        if !result.success {
            return result;
        }
        let outcome = self.observer.observe(&key, result.cas, requirement, is_delete).await;
        let status = match &outcome {
            DurabilityOutcome::Satisfied => return result,
            DurabilityOutcome::Modified => ResponseStatus::DocumentMutationDetected,
            DurabilityOutcome::TimedOut => ResponseStatus::OperationTimeout,
            DurabilityOutcome::ExpectationExceeded(_) => ResponseStatus::DurabilityExpectationExceeded,
            DurabilityOutcome::Failed(_) => ResponseStatus::DocumentMutationLost,
        };
        OperationResult {
            success: false,
            status,
            message: outcome_message(&outcome),
            ..result
        }
    }

    /// Whether `key` exists on its master, and with `cas` if that is not 0.
    pub async fn exists(&self, key: &str, cas: u64) -> OperationResult {
        let outcome = self
            .observer
            .observe(key, cas, DurabilityRequirement::default(), false)
            .await;
        let status = match &outcome {
            DurabilityOutcome::Satisfied => ResponseStatus::Success,
            DurabilityOutcome::Modified => ResponseStatus::DocumentMutationDetected,
            DurabilityOutcome::TimedOut => ResponseStatus::OperationTimeout,
            DurabilityOutcome::ExpectationExceeded(_) => ResponseStatus::DurabilityExpectationExceeded,
            DurabilityOutcome::Failed(_) => ResponseStatus::KeyNotFound,
        };
        OperationResult {
            success: status.is_success(),
            cas,
            ..OperationResult::failure(status, outcome_message(&outcome), 1)
        }
    }

    // -- replica reads ------------------------------------------------------

    /// Reads `key` from its replicas in slot order and returns the first
    /// success, or the last failure.
    pub async fn read_from_replica(&self, key: &str) -> OperationResult {
        let Some(route) = self.pool.route(key) else {
            let status = if self.pool.snapshot().is_empty() {
                ResponseStatus::NodeUnavailable
            } else {
                ResponseStatus::NoReplicasFound
            };
            return OperationResult::failure(status, status.description(), 0);
        };
        if route.replicas.is_empty() {
            return OperationResult::failure(
                ResponseStatus::NoReplicasFound,
                ResponseStatus::NoReplicasFound.description(),
                0,
            );
        }

        let mut op = self.operation(key, OperationKind::ReplicaRead);
        let mut last = None;
        for replica in &route.replicas {
            let attempt = op.record_attempt();
            let result = match replica.execute(op.request(route.vbucket.index())).await {
                Ok(response) => OperationResult::from_response(response, attempt),
                Err(e) => OperationResult::transport(e, attempt),
            };
            if result.success {
                return result;
            }
            debug!(key, endpoint = replica.endpoint(), status = %result.status, "replica read failed");
            last = Some(result);
        }
        last.unwrap_or_else(|| OperationResult::failure(ResponseStatus::NoReplicasFound, "No replica answered", 0))
    }

    // -- multi-key ----------------------------------------------------------

    pub async fn get_multi<I, K>(&self, keys: I) -> HashMap<String, OperationResult>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.run_multi(keys.into_iter().map(|k| (k.into(), OperationKind::Get)).collect())
            .await
    }

    pub async fn upsert_multi<I, K, V>(&self, items: I) -> HashMap<String, OperationResult>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Bytes>,
    {
        let batch = items
            .into_iter()
            .map(|(k, v)| {
                let kind = OperationKind::Store {
                    mode: StoreMode::Set,
                    value: v.into(),
                    flags: 0,
                    expiry: 0,
                };
                (k.into(), kind)
            })
            .collect();
        self.run_multi(batch).await
    }

    pub async fn remove_multi<I, K>(&self, keys: I) -> HashMap<String, OperationResult>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.run_multi(keys.into_iter().map(|k| (k.into(), OperationKind::Delete)).collect())
            .await
    }

    /// Splits the keys into `multi_parallelism` ranges and runs the ranges
    /// concurrently. Keys are independent: one failing never affects another.
    async fn run_multi(&self, items: Vec<(String, OperationKind)>) -> HashMap<String, OperationResult> {
        let mut results = HashMap::with_capacity(items.len());
        if items.is_empty() {
            return results;
        }
        let range = items.len().div_ceil(self.pool.config().multi_parallelism.max(1));

        let mut ranges = Vec::new();
        let mut items = items.into_iter();
        loop {
            let batch: Vec<_> = items.by_ref().take(range).collect();
            if batch.is_empty() {
                break;
            }
            let keys: Vec<String> = batch.iter().map(|(k, _)| k.clone()).collect();
            let executor = self.clone();
            let task = tokio::spawn(async move {
                let mut done = Vec::with_capacity(batch.len());
                for (key, kind) in batch {
                    let result = executor.send_with_retry(executor.operation(key.clone(), kind)).await;
                    done.push((key, result));
                }
                done
            });
            ranges.push((keys, task));
        }

        for (keys, task) in ranges {
            match task.await {
                Ok(done) => results.extend(done),
                Err(e) => {
                    warn!(error = %e, keys = keys.len(), "multi-key range failed");
                    for key in keys {
                        let failure = OperationResult::failure(ResponseStatus::ClientFailure, e.to_string(), 0);
                        results.insert(key, failure);
                    }
                }
            }
        }
        results
    }

    // -- convenience --------------------------------------------------------

    pub async fn get(&self, key: &str) -> OperationResult {
        self.send_with_retry(self.operation(key, OperationKind::Get)).await
    }

    pub async fn get_and_touch(&self, key: &str, expiry: u32) -> OperationResult {
        self.send_with_retry(self.operation(key, OperationKind::GetAndTouch { expiry }))
            .await
    }

    pub async fn touch(&self, key: &str, expiry: u32) -> OperationResult {
        self.send_with_retry(self.operation(key, OperationKind::Touch { expiry }))
            .await
    }

    pub async fn upsert(&self, key: &str, value: impl Into<Bytes>) -> OperationResult {
        self.send_with_retry(self.store_op(key, StoreMode::Set, value.into())).await
    }

    pub async fn insert(&self, key: &str, value: impl Into<Bytes>) -> OperationResult {
        self.send_with_retry(self.store_op(key, StoreMode::Add, value.into())).await
    }

    pub async fn replace(&self, key: &str, value: impl Into<Bytes>, cas: u64) -> OperationResult {
        self.send_with_retry(self.store_op(key, StoreMode::Replace, value.into()).with_cas(cas))
            .await
    }

    pub async fn remove(&self, key: &str, cas: u64) -> OperationResult {
        self.send_with_retry(self.operation(key, OperationKind::Delete).with_cas(cas))
            .await
    }

    #[must_use]
    pub fn store_op(&self, key: &str, mode: StoreMode, value: Bytes) -> Operation {
        let kind = OperationKind::Store {
            mode,
            value,
            flags: 0,
            expiry: 0,
        };
        self.operation(key, kind)
    }
}

fn outcome_message(outcome: &DurabilityOutcome) -> String {
    match outcome {
        DurabilityOutcome::Satisfied => "Durability requirement satisfied".to_string(),
        DurabilityOutcome::Modified => "The document was modified by another client".to_string(),
        DurabilityOutcome::TimedOut => "Durability requirement not met before the timeout".to_string(),
        DurabilityOutcome::ExpectationExceeded(msg) | DurabilityOutcome::Failed(msg) => msg.clone(),
    }
}
