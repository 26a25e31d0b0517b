//! Vbucket model: the server-authoritative mapping from keyspace partitions
//! to master and replica servers.
//!
//! - [`VBucket`]: one partition with its master and replica server indexes
//! - [`VBucketMap`]: validated, indexable map built from a configuration's
//!   [`VBucketServerMap`]
//!
//! Server indexes point into the configuration's `serverList`. A master of
//! `-1` means the vbucket is currently unowned; a replica slot of `-1` means
//! no replica is assigned. Neither is ever dereferenced.

use crate::config::VBucketServerMap;
use crate::error::TopologyError;
use crate::hash::HashAlgorithm;

// ---------------------------------------------------------------------------
// VBucket
// ---------------------------------------------------------------------------

/// One vbucket entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBucket {
    index: u16,
    master: i32,
    replicas: Vec<i32>,
}

impl VBucket {
    #[must_use]
    pub fn new(index: u16, master: i32, replicas: Vec<i32>) -> Self {
        Self {
            index,
            master,
            replicas,
        }
    }

    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Master server index, or `None` when the vbucket is unowned.
    #[must_use]
    pub fn master(&self) -> Option<usize> {
        usize::try_from(self.master).ok()
    }

    /// Raw replica slots, including `-1` placeholders.
    #[must_use]
    pub fn replica_slots(&self) -> &[i32] {
        &self.replicas
    }

    /// Number of configured replica slots, assigned or not.
    #[must_use]
    pub fn configured_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Assigned replica server indexes in slot order. `-1` slots are skipped.
    pub fn replicas(&self) -> impl Iterator<Item = usize> + '_ {
        self.replicas
            .iter()
            .filter_map(|&slot| usize::try_from(slot).ok())
    }
}

// ---------------------------------------------------------------------------
// VBucketMap
// ---------------------------------------------------------------------------

/// A validated vbucket map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VBucketMap {
    algorithm: HashAlgorithm,
    num_replicas: usize,
    server_count: usize,
    vbuckets: Vec<VBucket>,
}

impl VBucketMap {
    /// Builds a map from a configuration's server map section.
    ///
    /// # Errors
    ///
    /// - [`TopologyError::UnsupportedHashAlgorithm`] for an unknown algorithm
    /// - [`TopologyError::EmptyVBucketMap`] when there are no vbuckets
    /// - [`TopologyError::EmptyVBucketEntry`] when an entry has no master slot
    /// - [`TopologyError::ServerIndexOutOfRange`] when a master or replica
    ///   index is at or past the end of the server list
    pub fn from_server_map(map: &VBucketServerMap) -> Result<Self, TopologyError> {
        let algorithm = HashAlgorithm::parse(&map.hash_algorithm)?;
        Self::build(
            algorithm,
            map.num_replicas,
            map.server_list.len(),
            &map.vbucket_map,
        )
    }

    /// Builds a map from raw entries.
    ///
    /// # Errors
    ///
    /// Same as [`VBucketMap::from_server_map`].
    pub fn build(
        algorithm: HashAlgorithm,
        num_replicas: usize,
        server_count: usize,
        entries: &[Vec<i32>],
    ) -> Result<Self, TopologyError> {
        if entries.is_empty() {
            return Err(TopologyError::EmptyVBucketMap);
        }
        if entries.len() > usize::from(u16::MAX) + 1 {
            return Err(TopologyError::TooManyVBuckets(entries.len()));
        }

        let out_of_range = |server: i32| usize::try_from(server).is_ok_and(|s| s >= server_count);

        let mut vbuckets = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let Some((&master, replicas)) = entry.split_first() else {
                return Err(TopologyError::EmptyVBucketEntry { index });
            };
            if let Some(&server) = std::iter::once(&master)
                .chain(replicas)
                .find(|&&s| out_of_range(s))
            {
                return Err(TopologyError::ServerIndexOutOfRange {
                    index,
                    server,
                    servers: server_count,
                });
            }
            // entries.len() <= 65536 was checked above
            #[allow(clippy::cast_possible_truncation)]
            vbuckets.push(VBucket::new(index as u16, master, replicas.to_vec()));
        }

        Ok(Self {
            algorithm,
            num_replicas,
            server_count,
            vbuckets,
        })
    }

    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Replica count declared by the server.
    #[must_use]
    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    #[must_use]
    pub fn server_count(&self) -> usize {
        self.server_count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vbuckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vbuckets.is_empty()
    }

    /// Vbucket index for a key: `hash(key) mod numVBuckets`.
    #[must_use]
    pub fn index_of(&self, key: &[u8]) -> u16 {
        let count = u32::try_from(self.vbuckets.len()).unwrap_or(u32::MAX);
        // < len <= 65536
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.algorithm.hash(key) % count) as u16;
        index
    }

    /// Vbucket responsible for a key.
    #[must_use]
    pub fn vbucket_for(&self, key: &[u8]) -> &VBucket {
        &self.vbuckets[usize::from(self.index_of(key))]
    }

    #[must_use]
    pub fn get(&self, index: u16) -> Option<&VBucket> {
        self.vbuckets.get(usize::from(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &VBucket> {
        self.vbuckets.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::crc32_vbucket_hash;

    fn server_map(servers: usize, entries: Vec<Vec<i32>>) -> VBucketServerMap {
        VBucketServerMap {
            hash_algorithm: "CRC".to_string(),
            num_replicas: 1,
            server_list: (0..servers).map(|i| format!("10.0.0.{i}:11210")).collect(),
            vbucket_map: entries,
        }
    }

    #[test]
    fn builds_and_skips_absent_replicas() {
        let map =
            VBucketMap::from_server_map(&server_map(3, vec![vec![0, 1], vec![1, -1], vec![2, 0]]))
                .unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.algorithm(), HashAlgorithm::Crc);

        let vb = map.get(1).unwrap();
        assert_eq!(vb.master(), Some(1));
        assert_eq!(vb.configured_replicas(), 1);
        assert_eq!(vb.replicas().count(), 0);
        assert_eq!(vb.replica_slots(), &[-1]);
    }

    #[test]
    fn unowned_master_is_none() {
        let map = VBucketMap::from_server_map(&server_map(2, vec![vec![-1, -1]])).unwrap();
        assert_eq!(map.get(0).unwrap().master(), None);
    }

    #[test]
    fn rejects_empty_map_and_entry() {
        assert!(matches!(
            VBucketMap::from_server_map(&server_map(2, vec![])),
            Err(TopologyError::EmptyVBucketMap)
        ));
        assert!(matches!(
            VBucketMap::from_server_map(&server_map(2, vec![vec![0], vec![]])),
            Err(TopologyError::EmptyVBucketEntry { index: 1 })
        ));
    }

    #[test]
    fn rejects_out_of_range_master_and_replica() {
        assert!(matches!(
            VBucketMap::from_server_map(&server_map(2, vec![vec![2, 0]])),
            Err(TopologyError::ServerIndexOutOfRange {
                index: 0,
                server: 2,
                servers: 2
            })
        ));
        assert!(matches!(
            VBucketMap::from_server_map(&server_map(2, vec![vec![0, 1], vec![1, 5]])),
            Err(TopologyError::ServerIndexOutOfRange {
                index: 1,
                server: 5,
                ..
            })
        ));
    }

    #[test]
    fn rejects_unknown_algorithm() {
        let mut raw = server_map(1, vec![vec![0]]);
        raw.hash_algorithm = "KETAMA".to_string();
        assert!(matches!(
            VBucketMap::from_server_map(&raw),
            Err(TopologyError::UnsupportedHashAlgorithm(_))
        ));
    }

    #[test]
    fn index_of_uses_crc_modulo_count() {
        let entries = vec![vec![0]; 1024];
        let map = VBucketMap::from_server_map(&server_map(1, entries)).unwrap();
        for key in ["user::42", "a", "", "some-longer-key-0001"] {
            let expected = crc32_vbucket_hash(key.as_bytes()) % 1024;
            assert_eq!(u32::from(map.index_of(key.as_bytes())), expected);
            assert_eq!(
                u32::from(map.vbucket_for(key.as_bytes()).index()),
                expected
            );
        }
    }
}
