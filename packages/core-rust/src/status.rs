//! Response status taxonomy.
//!
//! Codes below `0x0100` are the binary protocol's own status words. Codes at
//! `0x0199` and above never appear on the wire; the client assigns them to
//! failures it detects itself (no node, timeout, transport error, durability
//! outcomes) so that every result carries a single status value.

use std::fmt;

/// Status of a key-value operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    IncrDecrOnNonNumericValue,
    /// Not-my-vbucket: the contacted server no longer owns the vbucket.
    VBucketBelongsToAnotherServer,
    BucketNotConnected,
    Locked,
    AuthStale,
    AuthenticationError,
    AuthenticationContinue,
    InvalidRange,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,

    // client-side
    ClientFailure,
    OperationTimeout,
    NoReplicasFound,
    NodeUnavailable,
    TransportFailure,
    DocumentMutationLost,
    DocumentMutationDetected,
    DurabilityExpectationExceeded,

    /// A wire status this client does not know.
    Unknown(u16),
}

impl ResponseStatus {
    /// Maps a status word to a variant.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::KeyNotFound,
            0x02 => Self::KeyExists,
            0x03 => Self::ValueTooLarge,
            0x04 => Self::InvalidArguments,
            0x05 => Self::ItemNotStored,
            0x06 => Self::IncrDecrOnNonNumericValue,
            0x07 => Self::VBucketBelongsToAnotherServer,
            0x08 => Self::BucketNotConnected,
            0x09 => Self::Locked,
            0x1f => Self::AuthStale,
            0x20 => Self::AuthenticationError,
            0x21 => Self::AuthenticationContinue,
            0x22 => Self::InvalidRange,
            0x81 => Self::UnknownCommand,
            0x82 => Self::OutOfMemory,
            0x83 => Self::NotSupported,
            0x84 => Self::InternalError,
            0x85 => Self::Busy,
            0x86 => Self::TemporaryFailure,
            0x0199 => Self::ClientFailure,
            0x0200 => Self::OperationTimeout,
            0x0300 => Self::NoReplicasFound,
            0x0400 => Self::NodeUnavailable,
            0x0500 => Self::TransportFailure,
            0x0600 => Self::DocumentMutationLost,
            0x0601 => Self::DocumentMutationDetected,
            0x0700 => Self::DurabilityExpectationExceeded,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Success => 0x00,
            Self::KeyNotFound => 0x01,
            Self::KeyExists => 0x02,
            Self::ValueTooLarge => 0x03,
            Self::InvalidArguments => 0x04,
            Self::ItemNotStored => 0x05,
            Self::IncrDecrOnNonNumericValue => 0x06,
            Self::VBucketBelongsToAnotherServer => 0x07,
            Self::BucketNotConnected => 0x08,
            Self::Locked => 0x09,
            Self::AuthStale => 0x1f,
            Self::AuthenticationError => 0x20,
            Self::AuthenticationContinue => 0x21,
            Self::InvalidRange => 0x22,
            Self::UnknownCommand => 0x81,
            Self::OutOfMemory => 0x82,
            Self::NotSupported => 0x83,
            Self::InternalError => 0x84,
            Self::Busy => 0x85,
            Self::TemporaryFailure => 0x86,
            Self::ClientFailure => 0x0199,
            Self::OperationTimeout => 0x0200,
            Self::NoReplicasFound => 0x0300,
            Self::NodeUnavailable => 0x0400,
            Self::TransportFailure => 0x0500,
            Self::DocumentMutationLost => 0x0600,
            Self::DocumentMutationDetected => 0x0601,
            Self::DurabilityExpectationExceeded => 0x0700,
            Self::Unknown(code) => code,
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Whether the status means the client's topology is stale.
    #[must_use]
    pub fn is_not_my_vbucket(self) -> bool {
        self == Self::VBucketBelongsToAnotherServer
    }

    /// Whether the status was produced by the client rather than a server.
    #[must_use]
    pub fn is_client_side(self) -> bool {
        self.code() >= 0x0199
    }

    /// Short human-readable description.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::KeyNotFound => "key not found",
            Self::KeyExists => "key exists",
            Self::ValueTooLarge => "value too large",
            Self::InvalidArguments => "invalid arguments",
            Self::ItemNotStored => "item not stored",
            Self::IncrDecrOnNonNumericValue => "incr/decr on non-numeric value",
            Self::VBucketBelongsToAnotherServer => "vbucket belongs to another server",
            Self::BucketNotConnected => "bucket not connected",
            Self::Locked => "resource locked",
            Self::AuthStale => "authentication stale",
            Self::AuthenticationError => "authentication error",
            Self::AuthenticationContinue => "authentication continue",
            Self::InvalidRange => "invalid range",
            Self::UnknownCommand => "unknown command",
            Self::OutOfMemory => "out of memory",
            Self::NotSupported => "not supported",
            Self::InternalError => "internal error",
            Self::Busy => "server busy",
            Self::TemporaryFailure => "temporary failure",
            Self::ClientFailure => "client failure",
            Self::OperationTimeout => "operation timed out",
            Self::NoReplicasFound => "no replicas found",
            Self::NodeUnavailable => "server unavailable",
            Self::TransportFailure => "transport failure",
            Self::DocumentMutationLost => "document mutation lost",
            Self::DocumentMutationDetected => "document modified by another writer",
            Self::DurabilityExpectationExceeded => "durability expectation exceeds topology",
            Self::Unknown(_) => "unknown status",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04x})", self.description(), self.code())
    }
}

impl From<u16> for ResponseStatus {
    fn from(code: u16) -> Self {
        Self::from_code(code)
    }
}
