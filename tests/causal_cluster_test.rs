// Causal Replication Cluster Integration Test
//
// Drives a three-replica in-process cluster over the loopback bus and
// validates the end-to-end behavior of the store: sibling preservation
// under conflicting writes, tombstone-aware re-creation, causal ordering
// under reordered delivery, and pull-based state sync.

use std::collections::BTreeMap;
use std::sync::Arc;

use causal_kv::bus::MemoryBus;
use causal_kv::{Replica, ReplicaId, StoreError, Version, VersionVector};

/// Test harness for a small cluster sharing one loopback bus. Delivery is
/// driven explicitly so tests control exactly which messages arrive and in
/// what order.
struct ClusterHarness {
    bus: Arc<MemoryBus>,
    replicas: BTreeMap<ReplicaId, Replica>,
}

impl ClusterHarness {
    fn new(ids: &[&str]) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let bus = Arc::new(MemoryBus::new());
        let mut replicas = BTreeMap::new();
        for id in ids {
            let id = ReplicaId::new(*id);
            bus.register(id.clone());
            replicas.insert(id.clone(), Replica::in_memory(id, bus.clone()));
        }
        Self { bus, replicas }
    }

    fn replica(&self, id: &str) -> &Replica {
        &self.replicas[&ReplicaId::new(id)]
    }

    fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    /// Delivers the oldest message queued for `dest`.
    fn deliver_one(&self, dest: &str) {
        let dest = ReplicaId::new(dest);
        let (sender, msg) = self
            .bus
            .pop_message(&dest)
            .expect("no message queued for delivery");
        self.replicas[&dest].deliver_message(&sender, msg);
    }

    /// Drains every member's queue in identifier order, including
    /// messages enqueued to a member while its own queue is draining.
    fn deliver_all(&self) {
        for (id, replica) in &self.replicas {
            while let Some((sender, msg)) = self.bus.pop_message(id) {
                replica.deliver_message(&sender, msg);
            }
        }
    }

    fn reorder(&self, dest: &str) {
        self.bus.reorder(&ReplicaId::new(dest));
    }

    fn drop_all_messages(&self) {
        self.bus.clear_all();
    }
}

fn vv(entries: &[(&str, u64)]) -> VersionVector {
    let mut result = VersionVector::new();
    for (id, counter) in entries {
        result.update_version(&Version::new(*id, *counter));
    }
    result
}

fn val(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn sorted(mut values: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    values.sort();
    values
}

#[test]
fn create_single() {
    let cluster = ClusterHarness::new(&["AA", "BB"]);

    // Create on AA, do not propagate yet
    cluster.replica("AA").create("place", val("chicago")).unwrap();
    let aa_read = cluster.replica("AA").read("place");
    let bb_read = cluster.replica("BB").read("place");
    assert_eq!(aa_read.dependent_versions, vv(&[("AA", 1)]));
    assert_eq!(aa_read.values, vec![val("chicago")]);
    assert_eq!(bb_read.dependent_versions, VersionVector::new());
    assert!(bb_read.values.is_empty());

    cluster.deliver_all();
    let bb_read = cluster.replica("BB").read("place");
    assert_eq!(bb_read.dependent_versions, aa_read.dependent_versions);
    assert_eq!(bb_read.values, aa_read.values);
}

#[test]
fn create_conflict_preserves_siblings() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);

    cluster.replica("AA").create("place", val("chicago")).unwrap();
    cluster.replica("BB").create("place", val("munich")).unwrap();

    let aa_read = cluster.replica("AA").read("place");
    assert_eq!(aa_read.dependent_versions, vv(&[("AA", 1)]));
    assert_eq!(aa_read.values, vec![val("chicago")]);
    let bb_read = cluster.replica("BB").read("place");
    assert_eq!(bb_read.dependent_versions, vv(&[("BB", 1)]));
    assert_eq!(bb_read.values, vec![val("munich")]);

    cluster.deliver_all();

    for replica in cluster.replicas() {
        let result = replica.read("place");
        assert_eq!(result.dependent_versions, vv(&[("AA", 1), ("BB", 1)]));
        assert_eq!(sorted(result.values), vec![val("chicago"), val("munich")]);
    }
}

#[test]
fn create_disallows_known_conflict() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);

    cluster
        .replica("AA")
        .create("place", val("philadelphia"))
        .unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        assert!(matches!(
            replica.create("place", val("stockholm")),
            Err(StoreError::DuplicateKey(_))
        ));
    }
}

#[test]
fn create_many() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);

    cluster.replica("AA").create("ed.home", val("downtown")).unwrap();
    cluster.replica("AA").create("ed.food", val("taquitos")).unwrap();
    cluster.replica("BB").create("bob.home", val("uptown")).unwrap();
    cluster.replica("BB").create("bob.food", val("fish")).unwrap();
    cluster.deliver_all();
    cluster.replica("CC").create("jim.home", val("lefttown")).unwrap();
    cluster.replica("CC").create("jim.food", val("steak")).unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        assert_eq!(replica.read("ed.home").values, vec![val("downtown")]);
        assert_eq!(replica.read("ed.food").values, vec![val("taquitos")]);
        assert_eq!(replica.read("bob.home").values, vec![val("uptown")]);
        assert_eq!(replica.read("bob.food").values, vec![val("fish")]);
        assert_eq!(replica.read("jim.home").values, vec![val("lefttown")]);
        assert_eq!(replica.read("jim.food").values, vec![val("steak")]);
    }
}

#[test]
fn update_unknown_key_fails() {
    let cluster = ClusterHarness::new(&["AA"]);

    assert!(matches!(
        cluster
            .replica("AA")
            .update("fakekey", val("the_value"), &VersionVector::new()),
        Err(StoreError::NoSuchKey(_))
    ));
}

#[test]
fn update_with_dependents_from_the_future_fails() {
    let cluster = ClusterHarness::new(&["AA"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();

    let future = vv(&[("AA", 20)]);
    assert!(matches!(
        cluster.replica("AA").update("key1", val("new_value"), &future),
        Err(StoreError::InvalidDependents(_))
    ));
}

#[test]
fn update_succeeds() {
    let cluster = ClusterHarness::new(&["AA", "BB"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();
    cluster.deliver_all();

    let read = cluster.replica("AA").read("key1");
    cluster
        .replica("AA")
        .update("key1", val("new_value"), &read.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        assert_eq!(replica.read("key1").values, vec![val("new_value")]);
    }
}

#[test]
fn concurrent_update_on_same_replica_fails() {
    let cluster = ClusterHarness::new(&["AA"]);
    let replica = cluster.replica("AA");
    replica.create("key1", val("value1")).unwrap();

    // First client reads
    let first = replica.read("key1");

    // Second client reads and updates
    let second = replica.read("key1");
    replica
        .update("key1", val("new_value_1"), &second.dependent_versions)
        .unwrap();

    // First client's update is now stale
    assert!(matches!(
        replica.update("key1", val("new_value_2"), &first.dependent_versions),
        Err(StoreError::ConcurrentUpdate(_))
    ));
}

#[test]
fn concurrent_update_on_different_replica_fails() {
    let cluster = ClusterHarness::new(&["AA", "BB"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();
    cluster.deliver_all();

    let stale = cluster.replica("AA").read("key1");

    let fresh = cluster.replica("BB").read("key1");
    cluster
        .replica("BB")
        .update("key1", val("new_value_1"), &fresh.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    assert!(matches!(
        cluster
            .replica("AA")
            .update("key1", val("new_value_2"), &stale.dependent_versions),
        Err(StoreError::ConcurrentUpdate(_))
    ));
}

#[test]
fn conflicting_updates_converge_as_siblings() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();
    cluster.deliver_all();

    let aa_read = cluster.replica("AA").read("key1");
    cluster
        .replica("AA")
        .update("key1", val("new_value_1"), &aa_read.dependent_versions)
        .unwrap();
    let bb_read = cluster.replica("BB").read("key1");
    cluster
        .replica("BB")
        .update("key1", val("new_value_2"), &bb_read.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        let result = replica.read("key1");
        assert_eq!(
            sorted(result.values),
            vec![val("new_value_1"), val("new_value_2")]
        );
    }
}

#[test]
fn resolving_write_replaces_siblings() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();
    cluster.deliver_all();

    let aa_read = cluster.replica("AA").read("key1");
    cluster
        .replica("AA")
        .update("key1", val("new_value_1"), &aa_read.dependent_versions)
        .unwrap();
    let bb_read = cluster.replica("BB").read("key1");
    cluster
        .replica("BB")
        .update("key1", val("new_value_2"), &bb_read.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    // A client reads both siblings and issues the resolving write
    let aa_read = cluster.replica("AA").read("key1");
    assert_eq!(aa_read.values.len(), 2);
    cluster
        .replica("AA")
        .update("key1", val("new_value_3"), &aa_read.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        assert_eq!(replica.read("key1").values, vec![val("new_value_3")]);
    }
}

#[test]
fn delete_unknown_key_is_a_noop() {
    let cluster = ClusterHarness::new(&["AA"]);
    cluster
        .replica("AA")
        .delete("fakekey", &VersionVector::new())
        .unwrap();
}

#[test]
fn delete_hides_the_key_from_readers() {
    let cluster = ClusterHarness::new(&["AA", "BB"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();
    cluster.deliver_all();

    let read = cluster.replica("AA").read("key1");
    cluster
        .replica("AA")
        .delete("key1", &read.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        assert!(replica.read("key1").values.is_empty());
    }
}

#[test]
fn create_after_delete() {
    let cluster = ClusterHarness::new(&["AA", "BB"]);
    cluster.replica("AA").create("key1", val("value1")).unwrap();
    cluster.deliver_all();

    let read = cluster.replica("AA").read("key1");
    cluster
        .replica("AA")
        .delete("key1", &read.dependent_versions)
        .unwrap();
    cluster.deliver_all();

    // The tombstones become the causal ancestors of the new object
    cluster.replica("AA").create("key1", val("new_value")).unwrap();
    cluster.deliver_all();

    for replica in cluster.replicas() {
        assert_eq!(replica.read("key1").values, vec![val("new_value")]);
    }
}

#[test]
fn out_of_order_delivery_quarantines_gaps() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);
    cluster.replica("AA").create("key1.1", val("aaa")).unwrap();
    cluster.replica("AA").create("key2.1", val("bbb")).unwrap();
    cluster.replica("BB").create("key1.2", val("ccc")).unwrap();
    cluster.replica("BB").create("key2.2", val("ddd")).unwrap();
    cluster.reorder("CC");

    // BB's second write arrives first and stays quarantined
    cluster.deliver_one("CC");
    let cc = cluster.replica("CC");
    assert!(cc.read("key1.1").values.is_empty());
    assert!(cc.read("key2.1").values.is_empty());
    assert!(cc.read("key1.2").values.is_empty());
    assert!(cc.read("key2.2").values.is_empty());

    // BB's first write fills the gap; both become visible together
    cluster.deliver_one("CC");
    assert!(cc.read("key1.1").values.is_empty());
    assert!(cc.read("key2.1").values.is_empty());
    assert_eq!(cc.read("key1.2").values, vec![val("ccc")]);
    assert_eq!(cc.read("key2.2").values, vec![val("ddd")]);

    cluster.deliver_one("CC");
    assert!(cc.read("key1.1").values.is_empty());
    assert!(cc.read("key2.1").values.is_empty());

    cluster.deliver_one("CC");
    assert_eq!(cc.read("key1.1").values, vec![val("aaa")]);
    assert_eq!(cc.read("key2.1").values, vec![val("bbb")]);
    assert_eq!(cc.read("key1.2").values, vec![val("ccc")]);
    assert_eq!(cc.read("key2.2").values, vec![val("ddd")]);
}

#[test]
fn causal_plus_with_one_object() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);

    cluster.replica("AA").create("weather", val("rainy")).unwrap();
    cluster.deliver_one("BB");

    let read = cluster.replica("BB").read("weather");
    assert_eq!(read.values, vec![val("rainy")]);
    cluster
        .replica("BB")
        .update("weather", val("winterymix"), &read.dependent_versions)
        .unwrap();

    // The update reaches CC before the create it depends on; the stale
    // intermediate value must never be observable.
    let cc = cluster.replica("CC");
    assert!(cc.read("weather").values.is_empty());
    cluster.reorder("CC");

    cluster.deliver_one("CC");
    assert!(cc.read("weather").values.is_empty());

    cluster.deliver_one("CC");
    assert_eq!(cc.read("weather").values, vec![val("winterymix")]);
}

#[test]
fn causal_plus_with_two_objects() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);

    cluster.replica("AA").create("weather", val("rainy")).unwrap();
    cluster.deliver_one("BB");

    // The new object is causally after the observed one
    assert_eq!(cluster.replica("BB").read("weather").values, vec![val("rainy")]);
    cluster
        .replica("BB")
        .create("equipment", val("umbrella"))
        .unwrap();

    let cc = cluster.replica("CC");
    assert!(cc.read("weather").values.is_empty());
    assert!(cc.read("equipment").values.is_empty());
    cluster.reorder("CC");

    // The effect must not be visible before its cause
    cluster.deliver_one("CC");
    assert!(cc.read("weather").values.is_empty());
    assert!(cc.read("equipment").values.is_empty());

    cluster.deliver_one("CC");
    assert_eq!(cc.read("weather").values, vec![val("rainy")]);
    assert_eq!(cc.read("equipment").values, vec![val("umbrella")]);
}

#[test]
fn simple_sync() {
    let cluster = ClusterHarness::new(&["AA", "BB"]);

    cluster.replica("AA").create("location", val("london")).unwrap();
    cluster.replica("AA").create("day", val("sunday")).unwrap();
    cluster.drop_all_messages();
    cluster.deliver_all();
    assert!(cluster.replica("BB").read("location").values.is_empty());
    assert!(cluster.replica("BB").read("day").values.is_empty());

    cluster.replica("BB").request_sync(&ReplicaId::new("AA"));
    cluster.deliver_all(); // Deliver request
    cluster.deliver_all(); // Deliver responses
    assert_eq!(cluster.replica("BB").read("location").values, vec![val("london")]);
    assert_eq!(cluster.replica("BB").read("day").values, vec![val("sunday")]);
}

#[test]
fn sync_carries_conflicting_siblings() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);

    cluster.replica("AA").create("location", val("london")).unwrap();
    cluster.replica("BB").create("location", val("cambridge")).unwrap();
    cluster.deliver_one("AA");
    cluster.deliver_one("BB");
    cluster.drop_all_messages();
    for id in ["AA", "BB"] {
        let result = cluster.replica(id).read("location");
        assert_eq!(
            sorted(result.values),
            vec![val("cambridge"), val("london")]
        );
    }

    cluster.replica("CC").request_sync(&ReplicaId::new("AA"));
    cluster.deliver_all(); // Deliver request
    cluster.deliver_all(); // Deliver responses
    let result = cluster.replica("CC").read("location");
    assert_eq!(sorted(result.values), vec![val("cambridge"), val("london")]);
}

#[test]
fn sync_with_version_gaps() {
    let cluster = ClusterHarness::new(&["AA", "BB", "CC"]);
    let aa = cluster.replica("AA");

    // Separate the surviving object versions by counter gaps that exist
    // only in AA's knowledge
    aa.create("meal", val("chicken piccata")).unwrap();
    aa.create("time", val("19:00")).unwrap();
    for _ in 0..4 {
        let read = aa.read("time");
        aa.update("time", val("19:00"), &read.dependent_versions).unwrap();
    }
    aa.create("place", val("ronaldos")).unwrap();
    for _ in 0..4 {
        let read = aa.read("place");
        aa.update("place", val("ronaldos"), &read.dependent_versions)
            .unwrap();
    }
    cluster.drop_all_messages();

    cluster.replica("CC").request_sync(&ReplicaId::new("AA"));
    cluster.deliver_one("AA"); // Deliver request
    for _ in 0..4 {
        // Deliver the setup and data messages but not the completion
        cluster.deliver_one("CC");
    }

    // Without the completion the gaps stay open and nothing is visible
    let cc = cluster.replica("CC");
    assert!(cc.read("meal").values.is_empty());
    assert!(cc.read("time").values.is_empty());
    assert!(cc.read("place").values.is_empty());

    cluster.deliver_all();
    assert_eq!(cc.read("meal").values, vec![val("chicken piccata")]);
    assert_eq!(cc.read("time").values, vec![val("19:00")]);
    assert_eq!(cc.read("place").values, vec![val("ronaldos")]);
}
