use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ReplicaId, Version, VersionVector};

/// Per-replica slice of a `VersionSet`: the contiguous prefix
/// `[1..=prefix_max]` plus sparse counters above it.
///
/// Invariants: every extra is strictly greater than `prefix_max`, and
/// `prefix_max + 1` is never an extra (it would have been absorbed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct VersionSetElement {
    prefix_max: u64,
    extras: BTreeSet<u64>,
}

impl VersionSetElement {
    fn insert(&mut self, counter: u64) {
        if counter <= self.prefix_max {
            return;
        }
        if counter == self.prefix_max + 1 {
            self.prefix_max = counter;
            self.extras.remove(&counter);
            self.absorb_extras();
        } else {
            self.extras.insert(counter);
        }
    }

    fn update_prefix_upper_bound(&mut self, counter: u64) {
        if counter > self.prefix_max {
            self.prefix_max = counter;
            self.drop_covered_extras();
            self.absorb_extras();
        }
    }

    fn insert_extras(&mut self, extras: impl IntoIterator<Item = u64>) {
        self.extras.extend(extras);
        self.drop_covered_extras();
        self.absorb_extras();
    }

    fn contains(&self, counter: u64) -> bool {
        counter <= self.prefix_max || self.extras.contains(&counter)
    }

    fn drop_covered_extras(&mut self) {
        let bound = self.prefix_max;
        self.extras.retain(|counter| *counter > bound);
    }

    fn absorb_extras(&mut self) {
        while self.extras.remove(&(self.prefix_max + 1)) {
            self.prefix_max += 1;
        }
    }
}

/// Concise representation of a set of versions.
///
/// A replica's entire history is usually a single integer per peer (the
/// contiguous prefix); gaps from out-of-order delivery live in the sparse
/// extras and shrink away as they fill. The greatest contiguous prefix is
/// the largest version vector the set dominates, and is what gates
/// visibility: a version is safe to reveal only when every dependency is
/// contiguously known, not merely known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSet {
    elements: BTreeMap<ReplicaId, VersionSetElement>,
}

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Gets the version for a single replica in the greatest contiguous
    /// prefix.
    pub fn get_version(&self, replica_id: &ReplicaId) -> Version {
        let counter = self
            .elements
            .get(replica_id)
            .map(|e| e.prefix_max)
            .unwrap_or(0);
        Version::new(replica_id.clone(), counter)
    }

    /// Returns the greatest contiguous prefix of this set.
    ///
    /// This is the version vector that dominates the greatest number of
    /// versions in the set without dominating a version outside it;
    /// extras do not contribute.
    pub fn get_gcp(&self) -> VersionVector {
        let mut result = VersionVector::new();
        for (replica_id, element) in &self.elements {
            if element.prefix_max > 0 {
                result.update_version(&Version::new(replica_id.clone(), element.prefix_max));
            }
        }
        result
    }

    /// True when the greatest contiguous prefix dominates `vv`.
    pub fn dominates_vv(&self, vv: &VersionVector) -> bool {
        self.get_gcp().dominates(vv)
    }

    /// Membership test. Counter zero is in every set.
    pub fn has_version(&self, ver: &Version) -> bool {
        if ver.counter == 0 {
            return true;
        }
        self.elements
            .get(&ver.replica_id)
            .is_some_and(|e| e.contains(ver.counter))
    }

    /// Inserts a single version into the set.
    pub fn insert_version(&mut self, ver: &Version) {
        self.element_mut(&ver.replica_id).insert(ver.counter);
    }

    /// Merges another set into this one so that this set contains the
    /// union of all versions in both.
    pub fn merge(&mut self, other: &VersionSet) {
        for (replica_id, other_element) in &other.elements {
            let element = self.element_mut(replica_id);
            element.update_prefix_upper_bound(other_element.prefix_max);
            element.insert_extras(other_element.extras.iter().copied());
        }
    }

    /// Merges one version into the set together with every version from
    /// the same replica prior to it (prefix expansion).
    pub fn merge_one_version(&mut self, ver: &Version) {
        self.element_mut(&ver.replica_id)
            .update_prefix_upper_bound(ver.counter);
    }

    fn element_mut(&mut self, replica_id: &ReplicaId) -> &mut VersionSetElement {
        self.elements.entry(replica_id.clone()).or_default()
    }
}

impl FromIterator<Version> for VersionSet {
    fn from_iter<I: IntoIterator<Item = Version>>(iter: I) -> Self {
        let mut set = VersionSet::new();
        for ver in iter {
            set.insert_version(&ver);
        }
        set
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ ")?;
        for (replica_id, element) in &self.elements {
            write!(f, "{}:{}", replica_id, element.prefix_max)?;
            if !element.extras.is_empty() {
                let extras: Vec<String> =
                    element.extras.iter().map(|c| c.to_string()).collect();
                write!(f, "+[{}]", extras.join(","))?;
            }
            write!(f, " ")?;
        }
        write!(f, "]")
    }
}
