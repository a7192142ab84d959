//! # Waggle Topology
//!
//! The topology manager owns the communication graph of a swarm: nodes with
//! roles, weighted edges installed according to the configured topology
//! shape, partitions with their own leaders, and a deterministic global
//! leader election. All mutations are serialised through the manager.

pub mod manager;
pub mod types;

pub use manager::{TopologyConfig, TopologyManager};
pub use types::{NodePatch, NodeScore, NodeStatus, Partition, TopologyEdge, TopologyNode, TopologyState};
