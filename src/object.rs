// # Object Records
//
// Per-key sibling history. Concurrent writes to the same key survive side
// by side as sibling versions until a later write supersedes them, and a
// delete is just a sibling with no value (a tombstone).

use serde::{Deserialize, Serialize};

use crate::version::{Version, VersionVector};

/// Opaque object payload. The store never interprets value bytes.
pub type Value = Vec<u8>;

/// One sibling version of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub version: Version,
    /// Causal timestamp of the write. `None` means the timestamp has been
    /// elided; it is recoverable from the committed visibility frontier
    /// that dominated the version at elision time.
    pub timestamp: Option<VersionVector>,
    /// `None` is a tombstone recording a delete.
    pub value: Option<Value>,
}

impl ObjectVersion {
    pub fn new(version: Version, timestamp: VersionVector, value: Option<Value>) -> Self {
        Self {
            version,
            timestamp: Some(timestamp),
            value,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Ordered sibling history for a single key. Non-empty once created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub versions: Vec<ObjectVersion>,
}

impl ObjectRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elides the stored timestamp when `vv` can stand in for it later.
    ///
    /// Safe only when the record holds a single version and `vv` dominates
    /// it: `vv` is causally complete, and with no sibling present the
    /// substitution cannot change any same-key causal relationship.
    pub fn elide_timestamp_for(&mut self, vv: &VersionVector) {
        if let [only] = self.versions.as_mut_slice() {
            if vv.dominates_version(&only.version) {
                only.timestamp = None;
            }
        }
    }
}

/// Result of a read: the surviving sibling values plus the version vector
/// the client must echo back on a subsequent update or delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadTuple {
    pub dependent_versions: VersionVector,
    pub values: Vec<Value>,
}
