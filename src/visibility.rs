// # Visibility Engine
//
// Decides which sibling versions of an object a replica may show readers,
// given its current knowledge and visibility frontier. This is the only
// place `visible` advances during a read, and the advance is monotone.

use crate::object::{ObjectRecord, Value};
use crate::version::{VersionSet, VersionVector};

/// Filters an object record down to its observable versions.
///
/// A version is visible when `visible` already dominates it, or when
/// `knowledge` contiguously covers its timestamp; the second case latches
/// the timestamp into `visible` so that every transitive dependency
/// surfaces together. Among the visible versions, one supersedes another
/// when its timestamp dominates the other's version; mutually undominated
/// siblings survive as concurrent.
///
/// Returns the dependent version vector (one entry per survivor) and the
/// surviving values in record order, tombstones included as `None`.
pub fn filter_visible_versions(
    knowledge: &VersionSet,
    visible: &mut VersionVector,
    committed_visible: &VersionVector,
    record: &ObjectRecord,
) -> (VersionVector, Vec<Option<Value>>) {
    debug_assert!(knowledge.dominates_vv(visible));
    debug_assert!(visible.dominates(committed_visible));

    let mut candidates = Vec::new();
    for ov in &record.versions {
        if visible.dominates_version(&ov.version) {
            candidates.push(ov);
            continue;
        }

        // Not visible, so not committed-visible either; an elided
        // timestamp would contradict that.
        debug_assert!(!committed_visible.dominates_version(&ov.version));
        let Some(timestamp) = &ov.timestamp else {
            debug_assert!(false, "elided timestamp on a non-visible version");
            continue;
        };

        if knowledge.dominates_vv(timestamp) {
            // Latch in a swath of versions as visible
            visible.update(timestamp);
            candidates.push(ov);
        }
    }

    // Pairwise supersession among the visible versions
    let mut alive: Vec<_> = candidates.into_iter().map(Some).collect();
    for i in 0..alive.len() {
        let Some(a) = alive[i] else { continue };
        for j in (i + 1)..alive.len() {
            let Some(b) = alive[j] else { continue };

            // Timestamps must be present because there are multiple
            // versions
            let (Some(a_ts), Some(b_ts)) = (a.timestamp.as_ref(), b.timestamp.as_ref()) else {
                debug_assert!(false, "sibling with elided timestamp");
                continue;
            };

            if a_ts.dominates_version(&b.version) {
                alive[j] = None;
            } else if b_ts.dominates_version(&a.version) {
                alive[i] = None;
                break;
            }
        }
    }

    let mut dependent_versions = VersionVector::new();
    let mut values = Vec::new();
    for ov in alive.into_iter().flatten() {
        // Two survivors from one replica would mean the replica
        // contradicted its own monotonic counter
        debug_assert_eq!(
            dependent_versions
                .get_version(&ov.version.replica_id)
                .counter,
            0
        );
        dependent_versions.update_version(&ov.version);
        values.push(ov.value.clone());
    }
    (dependent_versions, values)
}
