// # Object Storage
//
// Collaborator interface to the persistent key-value store backing a
// replica's object records, plus the in-memory implementation used by
// tests and simulations.

use std::collections::HashMap;

use crate::object::ObjectRecord;

/// Persistent store of key to object record.
///
/// Implementations must hand out and accept independent copies: a record
/// returned by `get` must never alias state that a later `put` mutates.
pub trait DataStore: Send {
    fn get(&self, key: &str) -> Option<ObjectRecord>;
    fn put(&mut self, key: &str, record: ObjectRecord);
    fn erase(&mut self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// In-memory `DataStore`. Records are cloned on the way in and out, which
/// satisfies the aliasing contract by construction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: HashMap<String, ObjectRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for MemoryStore {
    fn get(&self, key: &str) -> Option<ObjectRecord> {
        self.data.get(key).cloned()
    }

    fn put(&mut self, key: &str, record: ObjectRecord) {
        self.data.insert(key.to_string(), record);
    }

    fn erase(&mut self, key: &str) {
        self.data.remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }
}
