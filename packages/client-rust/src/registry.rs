//! Process-scoped bucket registry.
//!
//! The application owns one [`BucketRegistry`] and passes it to whatever
//! needs buckets. Opening a bucket that is already open hands out the same
//! [`Bucket`] and bumps its reference count; the bucket shuts down when the
//! last holder releases it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use keyroute_core::DurabilityRequirement;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::executor::RequestExecutor;
use crate::node::protocol::StoreMode;
use crate::operation::{Operation, OperationKind, OperationResult};
use crate::pool::NodePool;
use crate::traits::NodeHandle;

// ---------------------------------------------------------------------------
// PoolConnector
// ---------------------------------------------------------------------------

/// Builds a ready node pool for one bucket.
#[async_trait]
pub trait PoolConnector: Send + Sync {
    async fn connect(&self, config: ClientConfig) -> Result<NodePool, ClientError>;
}

/// Connects over HTTP bootstrap and TCP data connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveConnector;

#[async_trait]
impl PoolConnector for LiveConnector {
    async fn connect(&self, config: ClientConfig) -> Result<NodePool, ClientError> {
        NodePool::connect(config).await
    }
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// An open bucket. Thin façade over the bucket's [`RequestExecutor`].
#[derive(Debug)]
pub struct Bucket {
    name: String,
    refs: AtomicUsize,
    executor: RequestExecutor,
}

impl Bucket {
    fn new(name: &str, pool: NodePool) -> Self {
        Self {
            name: name.to_string(),
            refs: AtomicUsize::new(1),
            executor: RequestExecutor::new(pool),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Holders that have opened and not yet released the bucket.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    #[must_use]
    pub fn pool(&self) -> &NodePool {
        self.executor.pool()
    }

    fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference and returns how many are left.
    fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    // -- routing ------------------------------------------------------------

    #[must_use]
    pub fn locate(&self, key: &str) -> Option<NodeHandle> {
        self.pool().locate(key)
    }

    #[must_use]
    pub fn vbucket_for(&self, key: &str) -> u16 {
        self.pool().operation_factory().vbucket_for(key)
    }

    #[must_use]
    pub fn working_nodes(&self) -> Vec<NodeHandle> {
        self.pool().working_nodes()
    }

    // -- operations ---------------------------------------------------------

    pub async fn send(&self, op: Operation) -> OperationResult {
        self.executor.send_with_retry(op).await
    }

    #[must_use]
    pub fn send_async(&self, op: Operation) -> JoinHandle<OperationResult> {
        self.executor.send_with_retry_async(op)
    }

    pub async fn get(&self, key: &str) -> OperationResult {
        self.executor.get(key).await
    }

    pub async fn get_and_touch(&self, key: &str, expiry: u32) -> OperationResult {
        self.executor.get_and_touch(key, expiry).await
    }

    pub async fn get_from_replica(&self, key: &str) -> OperationResult {
        self.executor.read_from_replica(key).await
    }

    pub async fn touch(&self, key: &str, expiry: u32) -> OperationResult {
        self.executor.touch(key, expiry).await
    }

    pub async fn upsert(&self, key: &str, value: impl Into<Bytes>) -> OperationResult {
        self.executor.upsert(key, value).await
    }

    pub async fn insert(&self, key: &str, value: impl Into<Bytes>) -> OperationResult {
        self.executor.insert(key, value).await
    }

    pub async fn replace(&self, key: &str, value: impl Into<Bytes>, cas: u64) -> OperationResult {
        self.executor.replace(key, value, cas).await
    }

    pub async fn remove(&self, key: &str, cas: u64) -> OperationResult {
        self.executor.remove(key, cas).await
    }

    pub async fn upsert_durable(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        requirement: DurabilityRequirement,
    ) -> OperationResult {
        let op = self.executor.store_op(key, StoreMode::Set, value.into());
        self.executor.send_with_durability(op, false, requirement).await
    }

    pub async fn replace_durable(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        cas: u64,
        requirement: DurabilityRequirement,
    ) -> OperationResult {
        let op = self
            .executor
            .store_op(key, StoreMode::Replace, value.into())
            .with_cas(cas);
        self.executor.send_with_durability(op, false, requirement).await
    }

    pub async fn remove_durable(&self, key: &str, cas: u64, requirement: DurabilityRequirement) -> OperationResult {
        let op = self.executor.operation(key, OperationKind::Delete).with_cas(cas);
        self.executor.send_with_durability(op, true, requirement).await
    }

    pub async fn exists(&self, key: &str) -> OperationResult {
        self.executor.exists(key, 0).await
    }

    pub async fn get_multi(&self, keys: &[&str]) -> HashMap<String, OperationResult> {
        self.executor.get_multi(keys.iter().copied()).await
    }

    pub async fn upsert_multi<V: Into<Bytes>>(&self, items: Vec<(String, V)>) -> HashMap<String, OperationResult> {
        self.executor.upsert_multi(items).await
    }

    pub async fn remove_multi(&self, keys: &[&str]) -> HashMap<String, OperationResult> {
        self.executor.remove_multi(keys.iter().copied()).await
    }
}

// ---------------------------------------------------------------------------
// BucketRegistry
// ---------------------------------------------------------------------------

/// Open buckets by name.
pub struct BucketRegistry {
    template: ClientConfig,
    connector: Arc<dyn PoolConnector>,
    buckets: DashMap<String, Arc<Bucket>>,
    /// Serializes open and release so a bucket is never connected twice.
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BucketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("buckets", &self.buckets.len())
            .finish_non_exhaustive()
    }
}

impl BucketRegistry {
    /// A registry connecting to live clusters. `template` supplies
    /// everything but the bucket name.
    #[must_use]
    pub fn new(template: ClientConfig) -> Self {
        Self::with_connector(template, Arc::new(LiveConnector))
    }

    #[must_use]
    pub fn with_connector(template: ClientConfig, connector: Arc<dyn PoolConnector>) -> Self {
        Self {
            template,
            connector,
            buckets: DashMap::new(),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Opens `name` with the template's password.
    ///
    /// # Errors
    ///
    /// Returns the connector's error when the bucket is not open yet and
    /// cannot be connected.
    pub async fn open(&self, name: &str) -> Result<Arc<Bucket>, ClientError> {
        self.open_with_password(name, self.template.bucket_password.clone())
            .await
    }

    /// Opens `name`, or takes another reference to it if already open. The
    /// password only matters for the first open.
    ///
    /// # Errors
    ///
    /// Returns the connector's error when the bucket cannot be connected.
    pub async fn open_with_password(
        &self,
        name: &str,
        password: Option<String>,
    ) -> Result<Arc<Bucket>, ClientError> {
        let _guard = self.lifecycle.lock().await;
        if let Some(bucket) = self.get(name) {
            bucket.retain();
            return Ok(bucket);
        }

        let config = ClientConfig {
            bucket: name.to_string(),
            bucket_password: password,
            ..self.template.clone()
        };
        let pool = self.connector.connect(config).await?;
        let bucket = Arc::new(Bucket::new(name, pool));
        self.buckets.insert(name.to_string(), Arc::clone(&bucket));
        info!(bucket = name, "bucket opened");
        Ok(bucket)
    }

    /// An open bucket, without taking a reference.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops one reference to `name`. Returns `true` if that was the last
    /// one and the bucket was shut down.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BucketNotOpen`] for a bucket that is not open.
    pub async fn release(&self, name: &str) -> Result<bool, ClientError> {
        let _guard = self.lifecycle.lock().await;
        let bucket = self
            .get(name)
            .ok_or_else(|| ClientError::BucketNotOpen(name.to_string()))?;
        if bucket.release() > 0 {
            return Ok(false);
        }
        self.buckets.remove(name);
        bucket.pool().shutdown().await;
        info!(bucket = name, "bucket closed");
        Ok(true)
    }

    /// Shuts every open bucket down regardless of its reference count.
    pub async fn shutdown_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let names: Vec<String> = self.buckets.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            if let Some((_, bucket)) = self.buckets.remove(&name) {
                bucket.pool().shutdown().await;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use keyroute_core::{PersistTo, ReplicateTo, ResponseStatus};

    use super::*;
    use crate::test_support::{vbucket_config, MockNodeFactory};

    /// Pools over mock nodes, configured with a 3-node, 1-replica map.
    #[derive(Default)]
    struct MockConnector {
        factory: Arc<MockNodeFactory>,
        connects: AtomicUsize,
        passwords: parking_lot::Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl PoolConnector for MockConnector {
        async fn connect(&self, config: ClientConfig) -> Result<NodePool, ClientError> {
            if config.bucket == "missing" {
                return Err(ClientError::BootstrapTimeout { timeout_ms: 0 });
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.passwords.lock().push(config.bucket_password.clone());
            let pool = NodePool::new(config, self.factory.clone())?;
            pool.reconfigure(Some(vbucket_config(3, 64, 1))).await;
            Ok(pool)
        }
    }

    fn registry() -> (BucketRegistry, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::default());
        let registry = BucketRegistry::with_connector(ClientConfig::default(), connector.clone());
        (registry, connector)
    }

    #[tokio::test]
    async fn reopening_shares_one_bucket() {
        let (registry, connector) = registry();
        let first = registry.open("beer").await.unwrap();
        let second = registry.open("beer").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.ref_count(), 2);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn last_release_shuts_the_bucket_down() {
        let (registry, _) = registry();
        let bucket = registry.open("beer").await.unwrap();
        registry.open("beer").await.unwrap();

        assert!(!registry.release("beer").await.unwrap());
        assert!(bucket.locate("k").is_some());

        assert!(registry.release("beer").await.unwrap());
        assert!(registry.get("beer").is_none());
        assert!(bucket.locate("k").is_none());
        assert_eq!(bucket.get("k").await.status, ResponseStatus::NodeUnavailable);

        assert!(matches!(
            registry.release("beer").await,
            Err(ClientError::BucketNotOpen(_))
        ));
    }

    #[tokio::test]
    async fn failed_open_registers_nothing() {
        let (registry, _) = registry();
        assert!(registry.open("missing").await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn password_comes_from_the_first_open() {
        let (registry, connector) = registry();
        registry
            .open_with_password("secure", Some("s3cret".to_string()))
            .await
            .unwrap();
        registry.open("secure").await.unwrap();
        assert_eq!(*connector.passwords.lock(), vec![Some("s3cret".to_string())]);
    }

    #[tokio::test]
    async fn shutdown_all_closes_everything() {
        let (registry, connector) = registry();
        let a = registry.open("a").await.unwrap();
        registry.open("b").await.unwrap();

        registry.shutdown_all().await;
        assert!(registry.is_empty());
        assert!(a.working_nodes().is_empty());
        assert!(connector.factory.all_nodes().iter().all(|n| n.is_closed()));
    }

    #[tokio::test]
    async fn facade_routes_through_the_executor() {
        let (registry, connector) = registry();
        let bucket = registry.open("beer").await.unwrap();

        assert!(bucket.upsert("doc", "body").await.success);
        assert!(bucket.insert("doc2", "body").await.success);
        assert!(bucket.replace("doc", "body2", 1).await.success);
        assert!(bucket.get("doc").await.success);
        assert!(bucket.touch("doc", 60).await.success);
        assert!(bucket.remove("doc", 0).await.success);
        assert!(bucket.exists("doc2").await.success);
        assert_eq!(bucket.working_nodes().len(), 3);

        let node = bucket.locate("doc").unwrap();
        let server = connector.factory.server(node.endpoint());
        let before = server.request_count();
        let result = bucket.send_async(Operation::get("doc")).await.unwrap();
        assert!(result.success);
        assert_eq!(server.request_count(), before + 1);

        let durable = bucket
            .upsert_durable("doc", "body", DurabilityRequirement::new(ReplicateTo::One, PersistTo::One))
            .await;
        assert!(durable.success, "{durable:?}");

        let results = bucket.get_multi(&["a", "b", "c"]).await;
        assert_eq!(results.len(), 3);
    }
}
