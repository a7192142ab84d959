//! # Waggle Swarm
//!
//! The swarm coordination engine: a process-local runtime that registers
//! heterogeneous agents, routes tasks to them under a declared topology,
//! exchanges messages on a shared bus, and drives federated consensus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              SwarmCoordinator               │
//! ├──────────┬──────────┬───────────┬───────────┤
//! │ Topology │ Consensus│  Message  │  Domain   │
//! │ Manager  │  Engine  │    Bus    │  Router   │
//! ├──────────┴──────────┴───────────┴───────────┤
//! │     Agent Pools        │   Federation Hub   │
//! ├────────────────────────┴────────────────────┤
//! │    Agent₁     Agent₂     …     Agent₁₅      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! A task flows caller → [`SwarmCoordinator::submit_task`] → scoring →
//! `task_assign` on the bus → the agent reports `task_complete` or
//! `task_fail` → state update and release. Consensus is an orthogonal flow
//! driven by the engine; federation treats whole coordinators as members.

pub mod attention;
pub mod config;
pub mod coordinator;
pub mod domains;
pub mod federation;
pub mod metrics;
pub mod pool;

pub use attention::{combine, AgentOutput, AttentionMechanism, AttentionResult};
pub use config::CoordinatorConfig;
pub use coordinator::{
    AgentFilter, CoordinatorStatus, SwarmCoordinator, SwarmStateSnapshot,
};
pub use domains::{Domain, ParallelExecutionResult, HIERARCHY_LAYOUT};
pub use federation::{
    EphemeralAgent, EphemeralStatus, FederationConfig, FederationHub, FederationMessage,
    FederationProposal, SpawnOptions, SwarmEndpoint, SwarmRegistration, SwarmStatus,
};
pub use metrics::{CoordinatorMetrics, Ewma, LatencyWindow, PerformanceReport};
pub use pool::{AgentPool, PoolBackend, PoolConfig, PoolState};

// Re-export the component crates behind one façade.
pub use waggle_bus as bus;
pub use waggle_consensus as consensus;
pub use waggle_core as core;
pub use waggle_topology as topology;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        AgentFilter, AgentOutput, AttentionMechanism, CoordinatorConfig, CoordinatorStatus,
        Domain, EphemeralStatus, FederationConfig, FederationHub, ParallelExecutionResult,
        PoolConfig, SpawnOptions, SwarmCoordinator,
    };
    pub use waggle_bus::{Ack, Message, MessageKind, MessagePriority, Recipient};
    pub use waggle_consensus::{ConsensusConfig, ConsensusOutcome, ProposalStatus, Vote};
    pub use waggle_core::prelude::*;
    pub use waggle_topology::TopologyConfig;
}
