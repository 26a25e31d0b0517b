//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Configuration for a bucket connection: bootstrap, config streaming,
/// retry and durability behavior.
///
/// Durations are stored as milliseconds so the struct maps one-to-one onto a
/// JSON or TOML document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Bootstrap URIs, e.g. `http://10.0.0.1:8091/pools`.
    pub bootstrap_uris: Vec<String>,
    pub bucket: String,
    /// Used when the cluster does not hand out a SASL password itself.
    pub bucket_password: Option<String>,
    /// Connect timeout for management HTTP requests.
    pub http_connect_timeout_ms: u64,
    /// Consecutive failed reads against one streaming node before moving on.
    pub listener_retry_count: u32,
    /// Pause between in-place retries against the same streaming node.
    pub listener_retry_timeout_ms: u64,
    /// Pause after a pass in which every candidate was dead. Also the
    /// resurrection interval for failed data nodes.
    pub dead_timeout_ms: u64,
    pub heartbeat: HeartbeatConfig,
    /// Retries after the first attempt of a key-value operation.
    pub max_retries: u32,
    /// Wall-clock budget of one operation across all attempts.
    pub operation_lifespan_ms: u64,
    /// Timeout of a single attempt on the wire.
    pub send_timeout_ms: u64,
    pub observe_interval_ms: u64,
    pub observe_timeout_ms: u64,
    /// How long `start` waits for the first configuration.
    pub bootstrap_timeout_ms: u64,
    /// Concurrent keys in flight for multi-key operations.
    pub multi_parallelism: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_uris: vec!["http://127.0.0.1:8091/pools".to_string()],
            bucket: "default".to_string(),
            bucket_password: None,
            http_connect_timeout_ms: 10_000,
            listener_retry_count: 0,
            listener_retry_timeout_ms: 500,
            dead_timeout_ms: 10_000,
            heartbeat: HeartbeatConfig::default(),
            max_retries: 3,
            operation_lifespan_ms: 2_500,
            send_timeout_ms: 2_500,
            observe_interval_ms: 500,
            observe_timeout_ms: 10_000,
            bootstrap_timeout_ms: 30_000,
            multi_parallelism: 16,
        }
    }
}

impl ClientConfig {
    /// Checks the configuration for fatal setup errors.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoBootstrapUris`] for an empty bootstrap list
    /// and [`ClientError::InvalidConfig`] for unusable values.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.bootstrap_uris.is_empty() {
            return Err(ClientError::NoBootstrapUris);
        }
        if self.bucket.is_empty() {
            return Err(ClientError::InvalidConfig("bucket name is empty".into()));
        }
        if self.multi_parallelism == 0 {
            return Err(ClientError::InvalidConfig(
                "multiParallelism must be at least 1".into(),
            ));
        }
        if self.dead_timeout_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "deadTimeoutMs must be positive".into(),
            ));
        }
        if self.observe_interval_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "observeIntervalMs must be positive".into(),
            ));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "heartbeat.intervalMs must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_timeout_ms)
    }

    #[must_use]
    pub fn operation_lifespan(&self) -> Duration {
        Duration::from_millis(self.operation_lifespan_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub fn observe_interval(&self) -> Duration {
        Duration::from_millis(self.observe_interval_ms)
    }

    #[must_use]
    pub fn observe_timeout(&self) -> Duration {
        Duration::from_millis(self.observe_timeout_ms)
    }

    #[must_use]
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    #[must_use]
    pub fn listener_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_retry_timeout_ms)
    }
}

/// Heartbeat probing of the streaming node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Probe target. Defaults to the bootstrap URI the stream came from.
    pub uri: Option<String>,
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uri: None,
            interval_ms: 10_000,
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
