//! Durability vocabulary: replication and persistence requirements and the
//! per-node key states reported by observe.

use std::fmt;

/// Number of replicas a mutation must reach (in memory) before success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ReplicateTo {
    #[default]
    Zero,
    One,
    Two,
    Three,
}

impl ReplicateTo {
    #[must_use]
    pub fn count(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }
}

impl TryFrom<u8> for ReplicateTo {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(other),
        }
    }
}

/// Number of nodes, master included, a mutation must be persisted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PersistTo {
    #[default]
    Zero,
    One,
    Two,
    Three,
    Four,
}

impl PersistTo {
    #[must_use]
    pub fn count(self) -> usize {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }
}

impl TryFrom<u8> for PersistTo {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            4 => Ok(Self::Four),
            other => Err(other),
        }
    }
}

/// A `(ReplicateTo, PersistTo)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DurabilityRequirement {
    pub replicate_to: ReplicateTo,
    pub persist_to: PersistTo,
}

impl DurabilityRequirement {
    #[must_use]
    pub fn new(replicate_to: ReplicateTo, persist_to: PersistTo) -> Self {
        Self {
            replicate_to,
            persist_to,
        }
    }

    /// Neither replication nor persistence is requested.
    #[must_use]
    pub fn is_none(self) -> bool {
        self.replicate_to == ReplicateTo::Zero && self.persist_to == PersistTo::Zero
    }

    /// Only persistence on the master is requested.
    #[must_use]
    pub fn is_master_persistence(self) -> bool {
        self.replicate_to == ReplicateTo::Zero && self.persist_to == PersistTo::One
    }

    /// Whether the requirement can be met by a vbucket with `replicas`
    /// configured replica slots.
    ///
    /// Replication needs one replica per count. Persistence beyond the
    /// master needs replicas as well, so a requirement above one is bounded
    /// by the replica count.
    #[must_use]
    pub fn fits(self, replicas: usize) -> bool {
        self.replicate_to.count() <= replicas && self.persist_to.count() <= replicas.max(1)
    }

    /// The success predicate applied to one observe round.
    ///
    /// `replica_persisted` does not count the master, hence `persist_to - 1`.
    #[must_use]
    pub fn is_satisfied(
        self,
        replica_found: usize,
        replica_persisted: usize,
        master_persisted: bool,
    ) -> bool {
        let replicate_to = self.replicate_to.count();
        let persist_to = self.persist_to.count();

        let replicated = replica_found >= replicate_to || replica_persisted >= replicate_to;
        let replica_persistence = replica_persisted >= persist_to.saturating_sub(1);
        let master_persistence = persist_to == 0 || master_persisted;

        replicated && replica_persistence && master_persistence
    }
}

impl fmt::Display for DurabilityRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replicate_to={} persist_to={}",
            self.replicate_to.count(),
            self.persist_to.count()
        )
    }
}

/// Key state reported by an observe command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserveKeyState {
    FoundNotPersisted,
    FoundPersisted,
    NotFound,
    LogicalDeleted,
}

impl ObserveKeyState {
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::FoundNotPersisted),
            0x01 => Some(Self::FoundPersisted),
            0x80 => Some(Self::NotFound),
            0x81 => Some(Self::LogicalDeleted),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::FoundNotPersisted => 0x00,
            Self::FoundPersisted => 0x01,
            Self::NotFound => 0x80,
            Self::LogicalDeleted => 0x81,
        }
    }

    /// The value is present, persisted or not.
    #[must_use]
    pub fn is_found(self) -> bool {
        matches!(self, Self::FoundNotPersisted | Self::FoundPersisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(r: u8, p: u8) -> DurabilityRequirement {
        DurabilityRequirement::new(
            ReplicateTo::try_from(r).unwrap(),
            PersistTo::try_from(p).unwrap(),
        )
    }

    #[test]
    fn satisfied_at_exact_boundary() {
        // replicate_to=2, persist_to=2: found 2, persisted 1, master persisted
        assert!(req(2, 2).is_satisfied(2, 1, true));
    }

    #[test]
    fn each_count_one_short_is_not_satisfied() {
        let r = req(2, 2);
        assert!(!r.is_satisfied(1, 1, true));
        assert!(!r.is_satisfied(2, 0, true));
        assert!(!r.is_satisfied(2, 1, false));
    }

    #[test]
    fn persisted_replicas_count_towards_replication() {
        assert!(req(1, 0).is_satisfied(0, 1, false));
    }

    #[test]
    fn persist_zero_ignores_master() {
        assert!(req(1, 0).is_satisfied(1, 0, false));
        assert!(req(0, 0).is_satisfied(0, 0, false));
    }

    #[test]
    fn master_persistence_needs_master_only() {
        assert!(req(0, 1).is_satisfied(0, 0, true));
        assert!(!req(0, 1).is_satisfied(5, 5, false));
        assert!(req(0, 1).is_master_persistence());
    }

    #[test]
    fn fits_checks_configured_replicas() {
        assert!(!req(0, 2).fits(1));
        assert!(!req(2, 0).fits(1));
        assert!(req(1, 1).fits(1));
        assert!(req(0, 1).fits(0));
        assert!(req(3, 3).fits(3));
        assert!(!req(0, 4).fits(3));
    }

    #[test]
    fn out_of_range_counts_are_rejected() {
        assert_eq!(ReplicateTo::try_from(4), Err(4));
        assert_eq!(PersistTo::try_from(5), Err(5));
    }

    #[test]
    fn observe_key_state_bytes() {
        for state in [
            ObserveKeyState::FoundNotPersisted,
            ObserveKeyState::FoundPersisted,
            ObserveKeyState::NotFound,
            ObserveKeyState::LogicalDeleted,
        ] {
            assert_eq!(ObserveKeyState::from_byte(state.to_byte()), Some(state));
        }
        assert_eq!(ObserveKeyState::from_byte(0x02), None);
        assert!(ObserveKeyState::FoundPersisted.is_found());
        assert!(!ObserveKeyState::LogicalDeleted.is_found());
    }
}
