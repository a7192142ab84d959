//! Configuration enums shared across components
//!
//! Component crates define their own config structs; the enumerations that
//! cross component boundaries (topology shape, consensus algorithm choice,
//! partitioning) live here so the coordinator can aggregate them without
//! circular dependencies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of the swarm communication topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Mesh,
    #[default]
    Hierarchical,
    Centralized,
    Hybrid,
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TopologyKind::Mesh => "mesh",
            TopologyKind::Hierarchical => "hierarchical",
            TopologyKind::Centralized => "centralized",
            TopologyKind::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// How nodes are assigned to partitions in a hybrid topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    Hash,
    Range,
    #[default]
    RoundRobin,
}

/// Consensus algorithm selection.
///
/// `Paxos` is reserved: it is accepted by the parser but rejected by
/// configuration validation until an implementation exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAlgorithmKind {
    #[default]
    Raft,
    Byzantine,
    Gossip,
    Paxos,
}

impl fmt::Display for ConsensusAlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsensusAlgorithmKind::Raft => "raft",
            ConsensusAlgorithmKind::Byzantine => "byzantine",
            ConsensusAlgorithmKind::Gossip => "gossip",
            ConsensusAlgorithmKind::Paxos => "paxos",
        };
        f.write_str(s)
    }
}
