// # Version Metadata
//
// Identity types for the replication protocol: a `Version` names a single
// write, a `VersionVector` is a causal frontier, and a `VersionSet` is the
// concise representation of everything a replica has ever observed.

use std::fmt;

use serde::{Deserialize, Serialize};

mod set;
mod vector;

pub use set::VersionSet;
pub use vector::VersionVector;

/// Strongly-typed replica identifier.
///
/// The protocol only needs identifiers to be hashable and totally
/// comparable; any token works.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the replica ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of a single write: the originating replica plus that replica's
/// monotonic counter at write time.
///
/// Versions from different replicas have no natural order, so this type
/// deliberately implements neither `Ord` nor `PartialOrd`; causal
/// relationships are expressed through `VersionVector` domination. Counter
/// zero is the sentinel for "no version from this replica observed".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub replica_id: ReplicaId,
    pub counter: u64,
}

impl Version {
    pub fn new(replica_id: impl Into<ReplicaId>, counter: u64) -> Self {
        Self {
            replica_id: replica_id.into(),
            counter,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica_id, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_componentwise() {
        assert_ne!(Version::new("AA", 1), Version::new("AA", 2));
        assert_ne!(Version::new("AA", 1), Version::new("BB", 1));
        assert_eq!(Version::new("BB", 1), Version::new("BB", 1));
    }

    #[test]
    fn display() {
        assert_eq!(Version::new("AA", 5).to_string(), "AA:5");
    }
}
