//! # Waggle Core
//!
//! Shared entity model for the Waggle swarm coordination engine: structured
//! identifiers, the agent and task domain types with their state machines,
//! the typed event stream, the common error enum, and the state store
//! abstraction used by components that opt into persistence.
//!
//! Every mutable entity lives in exactly one owning component; the types
//! here carry cross-references as identifiers only and are resolved on
//! demand, so no ownership cycles form between agents and tasks.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod store;
pub mod task;

pub use agent::{
    AgentCapabilities, AgentKind, AgentMetricsRecord, AgentSpec, AgentState, AgentStatus, NodeRole,
};
pub use config::{ConsensusAlgorithmKind, PartitionStrategy, TopologyKind};
pub use error::{SwarmError, SwarmResult};
pub use event::{EventBus, EventKind, SwarmEvent};
pub use ids::{AgentId, IdAllocator, SwarmId, TaskId};
pub use store::{FileStateStore, InMemoryStateStore, StateStore};
pub use task::{TaskKind, TaskPriority, TaskSpec, TaskState, TaskStatus};

/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;

/// Default health check interval in milliseconds.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;

/// Default task timeout in milliseconds.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 300_000;

/// Default consensus timeout in milliseconds.
pub const DEFAULT_CONSENSUS_TIMEOUT_MS: u64 = 30_000;

/// Default message time-to-live in milliseconds.
pub const DEFAULT_MESSAGE_TTL_MS: u64 = 60_000;

/// Default consensus approval threshold.
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.66;

/// Default maximum retries for a failing task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AgentCapabilities, AgentId, AgentKind, AgentSpec, AgentState, AgentStatus,
        ConsensusAlgorithmKind, EventBus, EventKind, IdAllocator, NodeRole, PartitionStrategy,
        StateStore, SwarmError, SwarmEvent, SwarmId, SwarmResult, TaskId, TaskKind, TaskPriority,
        TaskSpec, TaskState, TaskStatus, TopologyKind,
    };
}
