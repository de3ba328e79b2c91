// # Replica State Machine
//
// One replica of the store: local mutation (create/update/delete/read),
// broadcast emission, inbound update receipt, and both sides of the
// pull-based anti-entropy sync protocol.
//
// A single update mutex serializes every mutation of `knowledge`,
// `visible`, `committed_visible` and the backing store. Reads take it too:
// revealing a version can latch the visibility frontier forward, and the
// latch is a mutation.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::error::{Result, StoreError};
use crate::messages::Message;
use crate::object::{ObjectRecord, ObjectVersion, ReadTuple, Value};
use crate::storage::{DataStore, MemoryStore};
use crate::version::{ReplicaId, Version, VersionSet, VersionVector};
use crate::visibility::filter_visible_versions;

/// Counters describing a replica's replication activity.
#[derive(Debug, Clone, Default)]
pub struct ReplicaStats {
    pub local_writes: u64,
    pub updates_applied: u64,
    pub duplicate_updates_dropped: u64,
    pub syncs_requested: u64,
    pub syncs_served: u64,
    pub syncs_completed: u64,
    pub sync_messages_dropped: u64,
}

/// Requestor-side state of an in-flight sync.
#[derive(Debug, Default)]
struct SyncState {
    in_progress: bool,
    peer: Option<ReplicaId>,
    cookie: u32,
    server_knowledge: Option<VersionSet>,
    server_visible: Option<VersionVector>,
}

struct ReplicaState {
    db: Box<dyn DataStore>,
    /// Every version this replica has ever observed, gaps and all.
    knowledge: VersionSet,
    /// Causal frontier of versions shown to readers. Advanced by the
    /// visibility engine's latch; never shrinks.
    visible: VersionVector,
    /// Durable portion of `visible`.
    committed_visible: VersionVector,
    sync: SyncState,
    stats: ReplicaStats,
}

impl ReplicaState {
    fn filter_visible(&mut self, record: &ObjectRecord) -> (VersionVector, Vec<Option<Value>>) {
        filter_visible_versions(
            &self.knowledge,
            &mut self.visible,
            &self.committed_visible,
            record,
        )
    }

    fn sync_matches(&self, sender: &ReplicaId, cookie: u32) -> bool {
        self.sync.in_progress
            && self.sync.peer.as_ref() == Some(sender)
            && self.sync.cookie == cookie
    }
}

/// One replica of the store.
///
/// Clients may call any operation on any replica; replicas exchange
/// changes through the injected `MessageBus` and reconcile divergence via
/// `request_sync`.
pub struct Replica {
    replica_id: ReplicaId,
    bus: Arc<dyn MessageBus>,
    state: Mutex<ReplicaState>,
}

impl Replica {
    pub fn new(replica_id: ReplicaId, db: Box<dyn DataStore>, bus: Arc<dyn MessageBus>) -> Self {
        let knowledge = VersionSet::new();
        let committed_visible = VersionVector::new();
        debug_assert_eq!(
            knowledge.get_version(&replica_id),
            committed_visible.get_version(&replica_id)
        );
        debug_assert!(knowledge.dominates_vv(&committed_visible));
        let visible = committed_visible.clone();

        Self {
            replica_id,
            bus,
            state: Mutex::new(ReplicaState {
                db,
                knowledge,
                visible,
                committed_visible,
                sync: SyncState::default(),
                stats: ReplicaStats::default(),
            }),
        }
    }

    /// Creates a replica backed by an in-memory store.
    pub fn in_memory(replica_id: ReplicaId, bus: Arc<dyn MessageBus>) -> Self {
        Self::new(replica_id, Box::new(MemoryStore::new()), bus)
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn stats(&self) -> ReplicaStats {
        self.state.lock().stats.clone()
    }

    /// Reads the visible value(s) of `key`.
    ///
    /// Returns the surviving sibling values together with the dependent
    /// versions the caller must echo back on a subsequent update or
    /// delete. An unknown key, and a key whose surviving versions are all
    /// tombstones, both read as empty.
    pub fn read(&self, key: &str) -> ReadTuple {
        let mut state = self.state.lock();
        let Some(record) = state.db.get(key) else {
            return ReadTuple::default();
        };

        let (dependent_versions, values) = state.filter_visible(&record);
        let live: Vec<Value> = values.into_iter().flatten().collect();
        if live.is_empty() {
            return ReadTuple::default();
        }
        ReadTuple {
            dependent_versions,
            values: live,
        }
    }

    /// Creates an object under `key`.
    ///
    /// Fails with `DuplicateKey` when the key already has a visible
    /// non-tombstone value on this replica. Returns the version assigned
    /// to the write.
    pub fn create(&self, key: &str, value: Value) -> Result<Version> {
        debug!(replica = %self.replica_id, key, "create");

        let mut state = self.state.lock();
        let (record, dependent_versions) = match state.db.get(key) {
            Some(record) => {
                // The caller supplies no dependents for a create, but any
                // tombstones still stored are causal ancestors the new
                // object must follow.
                let (deps, values) = state.filter_visible(&record);
                if values.iter().any(|v| v.is_some()) {
                    return Err(StoreError::DuplicateKey(key.to_string()));
                }
                (record, deps)
            }
            None => (ObjectRecord::new(), VersionVector::new()),
        };
        self.local_update(&mut state, record, key, Some(value), &dependent_versions)
    }

    /// Updates the value of an existing object.
    ///
    /// `dependent_versions` is the vector returned by the `read` this
    /// update is based on; a mismatch with the replica's current visible
    /// dependency set fails with `ConcurrentUpdate` and the caller should
    /// re-read and retry.
    pub fn update(
        &self,
        key: &str,
        value: Value,
        dependent_versions: &VersionVector,
    ) -> Result<Version> {
        debug!(replica = %self.replica_id, key, deps = %dependent_versions, "update");

        let mut state = self.state.lock();
        let Some(record) = state.db.get(key) else {
            return Err(StoreError::NoSuchKey(key.to_string()));
        };
        self.local_update(&mut state, record, key, Some(value), dependent_versions)
    }

    /// Deletes the object under `key` by writing a tombstone. Deleting an
    /// unknown key is a no-op.
    pub fn delete(&self, key: &str, dependent_versions: &VersionVector) -> Result<()> {
        debug!(replica = %self.replica_id, key, deps = %dependent_versions, "delete");

        let mut state = self.state.lock();
        if let Some(record) = state.db.get(key) {
            self.local_update(&mut state, record, key, None, dependent_versions)?;
        }
        Ok(())
    }

    /// Requests a state sync from the given peer. A no-op while another
    /// sync is already in progress.
    pub fn request_sync(&self, peer: &ReplicaId) {
        let mut state = self.state.lock();
        if state.sync.in_progress {
            info!(
                replica = %self.replica_id,
                peer = ?state.sync.peer,
                "sync already in progress"
            );
            return;
        }

        info!(replica = %self.replica_id, peer = %peer, "requesting state sync");
        let cookie = rand::random::<u32>();
        state.sync = SyncState {
            in_progress: true,
            peer: Some(peer.clone()),
            cookie,
            server_knowledge: None,
            server_visible: None,
        };
        state.stats.syncs_requested += 1;
        let msg = Message::SyncRequest {
            cookie,
            requestor_knowledge: state.knowledge.clone(),
        };
        self.bus.send(&self.replica_id, peer, msg);
    }

    /// Entry point for the bus delivery callback. Inbound processing never
    /// surfaces errors: duplicates and out-of-context sync replies are
    /// dropped.
    pub fn deliver_message(&self, sender: &ReplicaId, msg: Message) {
        match msg {
            Message::Update { key, obj_ver } => self.process_update(sender, &key, obj_ver),
            Message::SyncRequest {
                cookie,
                requestor_knowledge,
            } => self.process_sync_request(sender, cookie, &requestor_knowledge),
            Message::SyncSetup {
                cookie,
                server_knowledge,
                server_visible,
            } => self.process_sync_setup(sender, cookie, server_knowledge, server_visible),
            Message::SyncData {
                cookie,
                key,
                obj_ver,
            } => self.process_sync_data(sender, cookie, &key, obj_ver),
            Message::SyncComplete { cookie } => self.process_sync_complete(sender, cookie),
        }
    }

    fn process_update(&self, sender: &ReplicaId, key: &str, obj_ver: ObjectVersion) {
        debug!(replica = %self.replica_id, from = %sender, key, "processing update");

        let mut state = self.state.lock();
        if state.knowledge.has_version(&obj_ver.version) {
            debug!(
                replica = %self.replica_id,
                version = %obj_ver.version,
                "duplicate update dropped"
            );
            state.stats.duplicate_updates_dropped += 1;
            return;
        }

        let record = state.db.get(key).unwrap_or_default();
        self.insert_object(&mut state, record, key, obj_ver);
        state.stats.updates_applied += 1;
    }

    fn process_sync_request(
        &self,
        requestor: &ReplicaId,
        cookie: u32,
        requestor_knowledge: &VersionSet,
    ) {
        info!(replica = %self.replica_id, requestor = %requestor, "serving state sync");

        let mut state = self.state.lock();
        self.bus.send(
            &self.replica_id,
            requestor,
            Message::SyncSetup {
                cookie,
                server_knowledge: state.knowledge.clone(),
                server_visible: state.committed_visible.clone(),
            },
        );

        for key in state.db.keys() {
            let Some(mut record) = state.db.get(&key) else {
                continue;
            };
            // Elide on the outgoing copy only; committed_visible is the
            // replacement timestamp the requestor will substitute.
            record.elide_timestamp_for(&state.committed_visible);

            for obj_ver in record.versions {
                if requestor_knowledge.has_version(&obj_ver.version) {
                    continue;
                }
                self.bus.send(
                    &self.replica_id,
                    requestor,
                    Message::SyncData {
                        cookie,
                        key: key.clone(),
                        obj_ver,
                    },
                );
            }
        }

        self.bus
            .send(&self.replica_id, requestor, Message::SyncComplete { cookie });
        state.stats.syncs_served += 1;
    }

    fn process_sync_setup(
        &self,
        sender: &ReplicaId,
        cookie: u32,
        server_knowledge: VersionSet,
        server_visible: VersionVector,
    ) {
        let mut state = self.state.lock();
        if !state.sync_matches(sender, cookie) {
            state.stats.sync_messages_dropped += 1;
            return;
        }
        if !server_knowledge.dominates_vv(&server_visible) {
            warn!(replica = %self.replica_id, from = %sender, "malformed sync setup dropped");
            state.stats.sync_messages_dropped += 1;
            return;
        }

        state.sync.server_knowledge = Some(server_knowledge);
        state.sync.server_visible = Some(server_visible);
    }

    fn process_sync_data(
        &self,
        sender: &ReplicaId,
        cookie: u32,
        key: &str,
        mut obj_ver: ObjectVersion,
    ) {
        let mut state = self.state.lock();
        if !state.sync_matches(sender, cookie) {
            state.stats.sync_messages_dropped += 1;
            return;
        }
        if state.knowledge.has_version(&obj_ver.version) {
            return;
        }

        // Data that outran the setup envelope is dropped: without the
        // server's visibility snapshot an elided timestamp cannot be
        // reconstructed.
        let Some(server_visible) = state.sync.server_visible.clone() else {
            warn!(replica = %self.replica_id, cookie, "sync data before setup dropped");
            state.stats.sync_messages_dropped += 1;
            return;
        };
        if obj_ver.timestamp.is_none() {
            obj_ver.timestamp = Some(server_visible);
        }

        let record = state.db.get(key).unwrap_or_default();
        self.insert_object(&mut state, record, key, obj_ver);
    }

    fn process_sync_complete(&self, sender: &ReplicaId, cookie: u32) {
        let mut state = self.state.lock();
        if !state.sync_matches(sender, cookie) {
            state.stats.sync_messages_dropped += 1;
            return;
        }
        let (Some(server_knowledge), Some(server_visible)) = (
            state.sync.server_knowledge.take(),
            state.sync.server_visible.take(),
        ) else {
            warn!(replica = %self.replica_id, cookie, "sync completion before setup dropped");
            state.stats.sync_messages_dropped += 1;
            return;
        };

        info!(
            replica = %self.replica_id,
            peer = %sender,
            knowledge = %server_knowledge,
            visible = %server_visible,
            "sync completed"
        );

        // Merging the server's knowledge fills counter gaps for versions
        // the server knew about but no longer stores.
        state.knowledge.merge(&server_knowledge);
        state.visible.update(&server_visible);
        let ReplicaState {
            visible,
            committed_visible,
            ..
        } = &mut *state;
        committed_visible.update(visible);

        state.sync = SyncState::default();
        state.stats.syncs_completed += 1;
    }

    fn local_update(
        &self,
        state: &mut ReplicaState,
        record: ObjectRecord,
        key: &str,
        value: Option<Value>,
        dependent_versions: &VersionVector,
    ) -> Result<Version> {
        let (visible_deps, _) = state.filter_visible(&record);

        // A write must be causally after everything this replica already
        // shows. A dependent set the frontier does not cover is from the
        // future; a mismatched set means an intervening write the caller
        // has not seen, which the caller must resolve and retry.
        if !state.visible.dominates(dependent_versions) {
            return Err(StoreError::InvalidDependents(
                "dependent versions from the future".to_string(),
            ));
        }
        if visible_deps != *dependent_versions {
            return Err(StoreError::ConcurrentUpdate(key.to_string()));
        }

        debug_assert!(state.knowledge.dominates_vv(&state.visible));
        debug_assert_eq!(
            state.knowledge.get_version(&self.replica_id),
            state.visible.get_version(&self.replica_id)
        );
        debug_assert!(state.visible.dominates(&state.committed_visible));
        debug_assert_eq!(
            state.visible.get_version(&self.replica_id),
            state.committed_visible.get_version(&self.replica_id)
        );

        let mut version = state.knowledge.get_version(&self.replica_id);
        version.counter += 1;
        let mut timestamp = state.visible.clone();
        timestamp.update_version(&version);
        let obj_ver = ObjectVersion::new(version.clone(), timestamp, value);

        // Broadcast a pre-insertion copy: insertion may elide the stored
        // timestamp, but the wire copy must carry it.
        let wire_copy = obj_ver.clone();
        self.insert_object(state, record, key, obj_ver);
        debug_assert!(wire_copy
            .timestamp
            .as_ref()
            .is_some_and(|ts| state.committed_visible.dominates(ts)));

        state.stats.local_writes += 1;
        self.bus.broadcast(
            &self.replica_id,
            Message::Update {
                key: key.to_string(),
                obj_ver: wire_copy,
            },
        );
        Ok(version)
    }

    fn insert_object(
        &self,
        state: &mut ReplicaState,
        mut record: ObjectRecord,
        key: &str,
        obj_ver: ObjectVersion,
    ) {
        debug_assert!(!state.knowledge.has_version(&obj_ver.version));
        debug_assert!(obj_ver.timestamp.is_some());
        debug!(
            replica = %self.replica_id,
            key,
            version = %obj_ver.version,
            "inserting object version"
        );

        // Reconstruct elided timestamps before the record is compared
        // against the incoming version; committed_visible satisfies every
        // constraint a discarded timestamp had.
        for ov in &mut record.versions {
            if ov.timestamp.is_none() {
                ov.timestamp = Some(state.committed_visible.clone());
            }
        }

        let version = obj_ver.version.clone();
        let timestamp = obj_ver.timestamp.clone();
        record.versions.push(obj_ver);
        state.knowledge.insert_version(&version);
        if let Some(ts) = &timestamp {
            if state.knowledge.dominates_vv(ts) {
                state.visible.update(ts);
            }
        }

        // A version is retained while it is a survivor or while it has not
        // yet been made visible; a superseded version the frontier already
        // covers may still matter to a peer only through `knowledge`,
        // which keeps it forever.
        let (survivors, _) = state.filter_visible(&record);
        record.versions.retain(|ov| {
            ov.version == survivors.get_version(&ov.version.replica_id)
                || !state.visible.dominates_version(&ov.version)
        });
        debug_assert!(!record.versions.is_empty());

        record.elide_timestamp_for(&state.visible);
        state.db.put(key, record);

        let ReplicaState {
            visible,
            committed_visible,
            ..
        } = &mut *state;
        committed_visible.update(visible);
    }
}
