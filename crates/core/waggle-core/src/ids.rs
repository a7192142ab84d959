//! Structured identifiers for swarms, agents and tasks
//!
//! Identifiers are opaque tuples: equality and hashing use only the `id`
//! component, while ordering uses the per-swarm monotonic counter so that
//! deterministic tie-breaks ("lowest instance wins") fall out of `Ord`.

use crate::{agent::AgentKind, task::TaskPriority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::atomic::{AtomicU64, Ordering},
};
use uuid::Uuid;

/// Identifier of a swarm: a coordinator instance and everything it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmId {
    pub id: Uuid,
    pub namespace: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl SwarmId {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.into(),
            version: 1,
            created_at: Utc::now(),
        }
    }
}

impl PartialEq for SwarmId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SwarmId {}

impl Hash for SwarmId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for SwarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@v{}", self.namespace, self.id, self.version)
    }
}

/// Identifier of an agent within a swarm.
///
/// `instance` is strictly increasing per swarm and never reused, so it
/// doubles as the deterministic tie-breaker during scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentId {
    pub id: Uuid,
    pub swarm: Uuid,
    pub kind: AgentKind,
    pub instance: u64,
}

impl PartialEq for AgentId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AgentId {}

impl Hash for AgentId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for AgentId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.instance
            .cmp(&other.instance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}({})", self.kind, self.instance, self.id)
    }
}

/// Identifier of a task within a swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskId {
    pub id: Uuid,
    pub swarm: Uuid,
    pub sequence: u64,
    pub priority: TaskPriority,
}

impl PartialEq for TaskId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskId {}

impl Hash for TaskId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}({})", self.sequence, self.id)
    }
}

/// Monotonic allocator for agent instances and task sequences.
///
/// One allocator exists per swarm; counters only ever advance, even across
/// unregister/register cycles, so identifiers are never reused.
#[derive(Debug)]
pub struct IdAllocator {
    swarm: Uuid,
    next_instance: AtomicU64,
    next_sequence: AtomicU64,
}

impl IdAllocator {
    pub fn new(swarm: Uuid) -> Self {
        Self {
            swarm,
            next_instance: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Allocate the next agent identifier.
    pub fn agent_id(&self, kind: AgentKind) -> AgentId {
        AgentId {
            id: Uuid::new_v4(),
            swarm: self.swarm,
            kind,
            instance: self.next_instance.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Allocate the next task identifier.
    pub fn task_id(&self, priority: TaskPriority) -> TaskId {
        TaskId {
            id: Uuid::new_v4(),
            swarm: self.swarm,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_are_strictly_increasing() {
        let alloc = IdAllocator::new(Uuid::new_v4());
        let a = alloc.agent_id(AgentKind::Coder);
        let b = alloc.agent_id(AgentKind::Tester);
        assert!(a.instance < b.instance);
        assert!(a < b);
    }

    #[test]
    fn sequences_are_strictly_increasing() {
        let alloc = IdAllocator::new(Uuid::new_v4());
        let mut last = 0;
        for _ in 0..100 {
            let t = alloc.task_id(TaskPriority::Normal);
            assert!(t.sequence > last);
            last = t.sequence;
        }
    }

    #[test]
    fn equality_ignores_metadata() {
        let alloc = IdAllocator::new(Uuid::new_v4());
        let a = alloc.agent_id(AgentKind::Coder);
        let mut b = a.clone();
        b.instance = 999;
        // Same uuid, different counter: still the same agent.
        assert_eq!(a, b);
    }
}
