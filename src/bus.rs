// # Message Bus
//
// Collaborator interface for inter-replica messaging, plus a queueing
// loopback bus for in-process clusters.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;

use crate::messages::Message;
use crate::version::ReplicaId;

/// Inter-replica transport: at-least-once delivery, no ordering
/// guarantees.
///
/// Emission is fire-and-forget; implementations must queue rather than
/// deliver synchronously into the sender, which may hold its update lock
/// while emitting.
pub trait MessageBus: Send + Sync {
    /// Queues `msg` for every member except the sender.
    fn broadcast(&self, sender: &ReplicaId, msg: Message);

    /// Queues `msg` for a single member. Unknown destinations are dropped.
    fn send(&self, sender: &ReplicaId, dest: &ReplicaId, msg: Message);
}

/// Queueing loopback bus for in-process clusters.
///
/// Delivery is explicit: a driver pops queued messages and hands them to
/// `Replica::deliver_message`, which lets tests and simulations reorder
/// and drop traffic at will.
#[derive(Default)]
pub struct MemoryBus {
    queues: Mutex<BTreeMap<ReplicaId, VecDeque<(ReplicaId, Message)>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a member, creating its inbound queue.
    pub fn register(&self, member: ReplicaId) {
        self.queues.lock().entry(member).or_default();
    }

    /// Pops the oldest message queued for `member`.
    pub fn pop_message(&self, member: &ReplicaId) -> Option<(ReplicaId, Message)> {
        self.queues.lock().get_mut(member)?.pop_front()
    }

    /// Number of messages waiting for `member`.
    pub fn pending(&self, member: &ReplicaId) -> usize {
        self.queues.lock().get(member).map_or(0, |q| q.len())
    }

    /// Reverses `member`'s queue to simulate reordered delivery.
    pub fn reorder(&self, member: &ReplicaId) {
        if let Some(queue) = self.queues.lock().get_mut(member) {
            let reversed: VecDeque<_> = queue.drain(..).rev().collect();
            *queue = reversed;
        }
    }

    /// Drops every queued message, simulating loss.
    pub fn clear_all(&self) {
        for queue in self.queues.lock().values_mut() {
            queue.clear();
        }
    }

    /// Registered members in identifier order.
    pub fn members(&self) -> Vec<ReplicaId> {
        self.queues.lock().keys().cloned().collect()
    }
}

impl MessageBus for MemoryBus {
    fn broadcast(&self, sender: &ReplicaId, msg: Message) {
        let mut queues = self.queues.lock();
        for (member, queue) in queues.iter_mut() {
            if member != sender {
                queue.push_back((sender.clone(), msg.clone()));
            }
        }
    }

    fn send(&self, sender: &ReplicaId, dest: &ReplicaId, msg: Message) {
        if let Some(queue) = self.queues.lock().get_mut(dest) {
            queue.push_back((sender.clone(), msg));
        }
    }
}
