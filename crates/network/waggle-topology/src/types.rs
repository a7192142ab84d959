//! Topology graph types

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;
use waggle_core::{AgentId, NodeRole};

/// Availability of a topology node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Active,
    /// Currently executing work; not eligible for rebalancing moves.
    Busy,
    /// Being emptied of work before removal or a partition move.
    Draining,
    Offline,
}

/// Election inputs for a node, kept current by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeScore {
    pub health: f64,
    pub reliability: f64,
    pub workload: f64,
}

impl Default for NodeScore {
    fn default() -> Self {
        Self {
            health: 1.0,
            reliability: 1.0,
            workload: 0.0,
        }
    }
}

impl NodeScore {
    /// Composite election score: `health × reliability − workload`.
    pub fn composite(&self) -> f64 {
        self.health * self.reliability - self.workload
    }
}

/// A node in the communication graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNode {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub score: NodeScore,
    pub connections: HashSet<AgentId>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TopologyNode {
    pub fn new(agent_id: AgentId, role: NodeRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            role,
            status: NodeStatus::Active,
            score: NodeScore::default(),
            connections: HashSet::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A weighted edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyEdge {
    pub from: AgentId,
    pub to: AgentId,
    pub weight: f64,
    pub bidirectional: bool,
    pub latency_ms: Option<f64>,
}

impl TopologyEdge {
    pub fn symmetric(from: AgentId, to: AgentId) -> Self {
        Self {
            from,
            to,
            weight: 1.0,
            bidirectional: true,
            latency_ms: None,
        }
    }

    pub fn directed(from: AgentId, to: AgentId) -> Self {
        Self {
            from,
            to,
            weight: 1.0,
            bidirectional: false,
            latency_ms: None,
        }
    }

    /// Path-finding cost: measured latency when present, else the weight.
    pub fn cost(&self) -> f64 {
        self.latency_ms.unwrap_or(self.weight)
    }

    /// Whether this edge connects `a` towards `b`.
    pub fn links(&self, a: &AgentId, b: &AgentId) -> bool {
        (&self.from == a && &self.to == b) || (self.bidirectional && &self.from == b && &self.to == a)
    }
}

/// A partition: a subset of nodes with its own leader and replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub id: Uuid,
    pub leader: AgentId,
    pub replicas: HashSet<AgentId>,
}

impl Partition {
    pub fn members(&self) -> impl Iterator<Item = &AgentId> {
        std::iter::once(&self.leader).chain(self.replicas.iter())
    }

    pub fn len(&self) -> usize {
        1 + self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Patch applied to an existing node via `update_node`.
#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub role: Option<NodeRole>,
    pub status: Option<NodeStatus>,
    pub score: Option<NodeScore>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Immutable snapshot of the whole topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyState {
    pub kind: waggle_core::TopologyKind,
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
    pub partitions: Vec<Partition>,
    pub leader: Option<AgentId>,
}
