use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ReplicaId, Version};

/// Causal timestamp: the highest observed counter per replica.
///
/// Replicas with no entry read as counter zero, and zero counters are never
/// stored, so derived equality matches semantic equality. Merging is the
/// pointwise maximum, which is commutative, associative and idempotent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    versions: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the vector has no counter greater than zero.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Checks if this version vector dominates another.
    ///
    /// X dominates Y when every per-replica counter in X is greater than
    /// or equal to the one in Y. Reflexive and transitive, but not
    /// antisymmetric: equal vectors dominate each other.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .versions
            .iter()
            .all(|(replica_id, counter)| self.counter_of(replica_id) >= *counter)
    }

    /// Checks if this version vector dominates a single version.
    pub fn dominates_version(&self, ver: &Version) -> bool {
        self.counter_of(&ver.replica_id) >= ver.counter
    }

    /// Merges another version vector into this one, keeping the maximum
    /// counter from both sides.
    pub fn update(&mut self, other: &VersionVector) {
        for (replica_id, counter) in &other.versions {
            self.update_version(&Version::new(replica_id.clone(), *counter));
        }
    }

    /// Merges one version into the vector, raising the counter for its
    /// replica if the version is newer.
    pub fn update_version(&mut self, ver: &Version) {
        if ver.counter == 0 {
            return;
        }
        let entry = self.versions.entry(ver.replica_id.clone()).or_insert(0);
        *entry = (*entry).max(ver.counter);
    }

    /// Gets the version recorded for a single replica; counter zero when
    /// the replica has no entry.
    pub fn get_version(&self, replica_id: &ReplicaId) -> Version {
        Version::new(replica_id.clone(), self.counter_of(replica_id))
    }

    /// Increments the counter for a single replica.
    pub fn inc_version(&mut self, replica_id: &ReplicaId) -> Version {
        let entry = self.versions.entry(replica_id.clone()).or_insert(0);
        *entry += 1;
        Version::new(replica_id.clone(), *entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.versions.iter().map(|(replica_id, c)| (replica_id, *c))
    }

    fn counter_of(&self, replica_id: &ReplicaId) -> u64 {
        self.versions.get(replica_id).copied().unwrap_or(0)
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ ")?;
        for (replica_id, counter) in &self.versions {
            write!(f, "{}:{} ", replica_id, counter)?;
        }
        write!(f, "]")
    }
}
