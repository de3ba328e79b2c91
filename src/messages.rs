// # Replication Messages
//
// Replica-to-replica protocol messages. All variants carry plain data and
// no references into replica state, so a message can be serialized, queued
// and re-delivered freely.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::object::ObjectVersion;
use crate::version::{VersionSet, VersionVector};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Broadcast to all peers after a local write.
    Update { key: String, obj_ver: ObjectVersion },

    /// Initiates a pull-based anti-entropy sync.
    SyncRequest {
        cookie: u32,
        requestor_knowledge: VersionSet,
    },

    /// The responder's snapshot envelope opening a sync.
    SyncSetup {
        cookie: u32,
        server_knowledge: VersionSet,
        server_visible: VersionVector,
    },

    /// One object version of a sync. An elided timestamp means "use the
    /// setup's `server_visible`".
    SyncData {
        cookie: u32,
        key: String,
        obj_ver: ObjectVersion,
    },

    /// Terminator; the requestor promotes the received knowledge and
    /// visibility into its own state.
    SyncComplete { cookie: u32 },
}

impl Message {
    /// Encodes the message for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decodes a message from the wire.
    pub fn decode(buf: &[u8]) -> Result<Message> {
        let (msg, _) = bincode::serde::decode_from_slice(buf, bincode::config::standard())?;
        Ok(msg)
    }
}
