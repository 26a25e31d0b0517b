//! Key-value operations and their results.

use std::time::Duration;

use bytes::Bytes;
use keyroute_core::ResponseStatus;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::node::protocol::{Request, Response, StoreMode};

/// Attempt budget when none is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Wall-clock budget when none is configured.
pub const DEFAULT_LIFESPAN: Duration = Duration::from_millis(2_500);

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Get,
    GetAndTouch { expiry: u32 },
    Touch { expiry: u32 },
    Store {
        mode: StoreMode,
        value: Bytes,
        flags: u32,
        expiry: u32,
    },
    Delete,
    ReplicaRead,
}

/// One key-value operation and its retry bookkeeping.
///
/// Only the executor's retry loop mutates it, by counting attempts.
#[derive(Debug, Clone)]
pub struct Operation {
    key: String,
    kind: OperationKind,
    cas: u64,
    attempts: u32,
    max_retries: u32,
    created_at: Instant,
    lifespan: Duration,
}

impl Operation {
    #[must_use]
    pub fn new(key: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            key: key.into(),
            kind,
            cas: 0,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Instant::now(),
            lifespan: DEFAULT_LIFESPAN,
        }
    }

    #[must_use]
    pub fn get(key: impl Into<String>) -> Self {
        Self::new(key, OperationKind::Get)
    }

    #[must_use]
    pub fn store(key: impl Into<String>, mode: StoreMode, value: impl Into<Bytes>) -> Self {
        Self::new(
            key,
            OperationKind::Store {
                mode,
                value: value.into(),
                flags: 0,
                expiry: 0,
            },
        )
    }

    #[must_use]
    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(key, OperationKind::Delete)
    }

    #[must_use]
    pub fn touch(key: impl Into<String>, expiry: u32) -> Self {
        Self::new(key, OperationKind::Touch { expiry })
    }

    #[must_use]
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the wall-clock budget, counted from when the operation was
    /// created.
    #[must_use]
    pub fn with_lifespan(mut self, lifespan: Duration) -> Self {
        self.lifespan = lifespan;
        self
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    #[must_use]
    pub fn cas(&self) -> u64 {
        self.cas
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.created_at + self.lifespan
    }

    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(self.kind, OperationKind::Store { .. } | OperationKind::Delete)
    }

    /// Reads and touches can be sent twice without changing the outcome.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        !self.is_mutation()
    }

    /// Whether a transport failure may be retried. CAS-guarded mutations
    /// qualify: a replay with a stale CAS is rejected, not applied twice.
    #[must_use]
    pub fn retries_transport_failures(&self) -> bool {
        self.is_idempotent() || self.cas != 0
    }

    /// The wire request for this operation against `vbucket`.
    #[must_use]
    pub fn request(&self, vbucket: u16) -> Request {
        match &self.kind {
            OperationKind::Get => Request::get(&self.key, vbucket),
            OperationKind::GetAndTouch { expiry } => Request::get_and_touch(&self.key, vbucket, *expiry),
            OperationKind::Touch { expiry } => Request::touch(&self.key, vbucket, *expiry),
            OperationKind::Store {
                mode,
                value,
                flags,
                expiry,
            } => Request::store(
                *mode,
                &self.key,
                vbucket,
                value.clone(),
                *flags,
                *expiry,
                self.cas,
            ),
            OperationKind::Delete => Request::delete(&self.key, vbucket, self.cas),
            OperationKind::ReplicaRead => Request::replica_read(&self.key, vbucket),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationResult
// ---------------------------------------------------------------------------

/// Outcome of an operation. Expected failures (missing key, CAS mismatch,
/// durability timeout) are results with `success == false`, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub success: bool,
    pub status: ResponseStatus,
    pub message: String,
    pub cas: u64,
    pub value: Option<Bytes>,
    pub flags: u32,
    /// Transport failure behind the result, if any.
    pub error: Option<TransportError>,
    pub attempts: u32,
}

impl OperationResult {
    #[must_use]
    pub fn from_response(response: Response, attempts: u32) -> Self {
        let success = response.status.is_success();
        let value = (success && !response.value.is_empty()).then_some(response.value);
        Self {
            success,
            status: response.status,
            message: response.status.description().to_string(),
            cas: response.cas,
            value,
            flags: response.flags,
            error: None,
            attempts,
        }
    }

    #[must_use]
    pub fn failure(status: ResponseStatus, message: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            status,
            message: message.into(),
            cas: 0,
            value: None,
            flags: 0,
            error: None,
            attempts,
        }
    }

    #[must_use]
    pub fn transport(error: TransportError, attempts: u32) -> Self {
        Self {
            error: Some(error.clone()),
            ..Self::failure(ResponseStatus::TransportFailure, error.to_string(), attempts)
        }
    }

    #[must_use]
    pub fn timed_out(attempts: u32) -> Self {
        Self::failure(ResponseStatus::OperationTimeout, "The operation has timed out.", attempts)
    }
}
