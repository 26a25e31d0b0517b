//! Key hashing for node location.
//!
//! Two hash functions are used by the locators:
//!
//! - [`fnv1a_hash`]: 32-bit FNV-1a, used to place nodes and keys on the
//!   consistent-hashing ring of basic (memcached-style) buckets.
//! - [`crc32_vbucket_hash`]: the server's `CRC` vbucket hash, used to map a
//!   key to a vbucket index. The upper half of the CRC-32 is taken and masked
//!   to 15 bits, which is the contract the server uses when it builds its own
//!   vbucket map, so both sides agree on key ownership.

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// FNV-1a offset basis (32-bit).
const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

/// FNV-1a prime (32-bit).
const FNV_PRIME: u32 = 0x0100_0193;

/// Computes a 32-bit FNV-1a hash over raw bytes.
///
/// # Examples
///
/// ```
/// use keyroute_core::hash::fnv1a_hash;
///
/// assert_eq!(fnv1a_hash(b"hello"), 1_335_831_723);
/// assert_eq!(fnv1a_hash(b""), 2_166_136_261); // FNV offset basis
/// ```
#[must_use]
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Computes the vbucket hash of a key: `(crc32(key) >> 16) & 0x7fff`.
///
/// The result still has to be reduced modulo the vbucket count.
///
/// # Examples
///
/// ```
/// use keyroute_core::hash::crc32_vbucket_hash;
///
/// assert_eq!(crc32_vbucket_hash(b"123456789"), 0x4bf4);
/// ```
#[must_use]
pub fn crc32_vbucket_hash(key: &[u8]) -> u32 {
    (crc32fast::hash(key) >> 16) & 0x7fff
}

/// Hash algorithm named by a vbucket server map (`hashAlgorithm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    /// CRC-32 based vbucket hash. The only algorithm current servers emit.
    Crc,
    /// FNV-1a, accepted for older and test configurations.
    Fnv1a,
}

impl HashAlgorithm {
    /// Parses the server's algorithm name. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::UnsupportedHashAlgorithm`] for unknown names.
    pub fn parse(name: &str) -> Result<Self, TopologyError> {
        match name.to_ascii_lowercase().as_str() {
            "crc" | "crc32" => Ok(Self::Crc),
            "fnv1a" | "fnv1a_32" => Ok(Self::Fnv1a),
            _ => Err(TopologyError::UnsupportedHashAlgorithm(name.to_string())),
        }
    }

    /// Hashes a key with this algorithm.
    #[must_use]
    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            Self::Crc => crc32_vbucket_hash(key),
            Self::Fnv1a => fnv1a_hash(key),
        }
    }
}
