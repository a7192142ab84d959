//! Topology manager: edge policy, leader election, partitioning, paths

use crate::types::{
    NodePatch, NodeStatus, Partition, TopologyEdge, TopologyNode, TopologyState,
};
use parking_lot::RwLock;
use petgraph::{algo::astar, graph::DiGraph};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;
use waggle_core::{
    AgentId, NodeRole, PartitionStrategy, SwarmError, SwarmResult, TopologyKind,
};

/// Configuration of the topology manager.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TopologyConfig {
    pub kind: TopologyKind,
    /// Hard cap on topology membership.
    pub max_agents: usize,
    /// Target partition size in a hybrid topology.
    pub replication_factor: usize,
    pub partition_strategy: PartitionStrategy,
    pub failover_enabled: bool,
    pub auto_rebalance: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            kind: TopologyKind::Hierarchical,
            max_agents: 100,
            replication_factor: 3,
            partition_strategy: PartitionStrategy::RoundRobin,
            failover_enabled: true,
            auto_rebalance: false,
        }
    }
}

impl TopologyConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_agents == 0 {
            return Err(SwarmError::Configuration(
                "topology.maxAgents must be positive".into(),
            ));
        }
        if self.replication_factor == 0 {
            return Err(SwarmError::Configuration(
                "topology.replicationFactor must be positive".into(),
            ));
        }
        Ok(())
    }
}

struct Inner {
    nodes: HashMap<AgentId, TopologyNode>,
    edges: Vec<TopologyEdge>,
    partitions: Vec<Partition>,
    leader: Option<AgentId>,
    round_robin: usize,
}

/// Owns the communication graph of one swarm. All mutations are serialised
/// behind a single lock, which is what gives leader election its
/// determinism guarantees.
pub struct TopologyManager {
    config: TopologyConfig,
    inner: RwLock<Inner>,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig) -> SwarmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                edges: Vec::new(),
                partitions: Vec::new(),
                leader: None,
                round_robin: 0,
            }),
        })
    }

    pub fn kind(&self) -> TopologyKind {
        self.config.kind
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.inner.read().nodes.contains_key(agent_id)
    }

    /// Insert a node and install edges according to the topology kind.
    /// Re-adding a known id is a no-op.
    pub fn add_node(&self, agent_id: AgentId, role: Option<NodeRole>) -> SwarmResult<NodeRole> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.nodes.get(&agent_id) {
            return Ok(existing.role);
        }
        if inner.nodes.len() >= self.config.max_agents {
            return Err(SwarmError::CapacityExceeded {
                resource: "topology nodes",
                current: inner.nodes.len(),
                max: self.config.max_agents,
            });
        }

        let assigned = match self.config.kind {
            TopologyKind::Mesh => self.add_mesh_node(&mut inner, agent_id.clone()),
            TopologyKind::Hierarchical => {
                self.add_hub_node(&mut inner, agent_id.clone(), role, NodeRole::Queen)
            }
            TopologyKind::Centralized => {
                self.add_hub_node(&mut inner, agent_id.clone(), role, NodeRole::Coordinator)
            }
            TopologyKind::Hybrid => self.add_hybrid_node(&mut inner, agent_id.clone(), role),
        };
        debug!(agent = %agent_id, role = ?assigned, kind = %self.config.kind, "topology node added");
        Ok(assigned)
    }

    /// Remove a node, its edges and its partition membership. Unknown ids
    /// are a no-op. If the removed node was the leader, a new leader is
    /// elected immediately.
    pub fn remove_node(&self, agent_id: &AgentId) -> Option<TopologyNode> {
        let mut inner = self.inner.write();
        let node = inner.nodes.remove(agent_id)?;

        inner.edges.retain(|e| &e.from != agent_id && &e.to != agent_id);
        for other in inner.nodes.values_mut() {
            other.connections.remove(agent_id);
        }

        // Partition bookkeeping: promote a replica when the leader leaves.
        let mut emptied = Vec::new();
        for (index, partition) in inner.partitions.iter_mut().enumerate() {
            if &partition.leader == agent_id {
                match partition.replicas.iter().min().cloned() {
                    Some(promoted) => {
                        partition.replicas.remove(&promoted);
                        partition.leader = promoted;
                    }
                    None => emptied.push(index),
                }
            } else {
                partition.replicas.remove(agent_id);
            }
        }
        for index in emptied.into_iter().rev() {
            inner.partitions.remove(index);
        }

        if inner.leader.as_ref() == Some(agent_id) {
            inner.leader = None;
            if self.config.failover_enabled {
                self.elect_locked(&mut inner);
            }
        }
        info!(agent = %agent_id, "topology node removed");
        Some(node)
    }

    /// Apply a patch to a node. Unknown ids are a no-op returning `false`.
    pub fn update_node(&self, agent_id: &AgentId, patch: NodePatch) -> bool {
        let mut inner = self.inner.write();
        let Some(node) = inner.nodes.get_mut(agent_id) else {
            return false;
        };
        if let Some(role) = patch.role {
            node.role = role;
        }
        if let Some(status) = patch.status {
            node.status = status;
        }
        if let Some(score) = patch.score {
            node.score = score;
        }
        if let Some(metadata) = patch.metadata {
            node.metadata.extend(metadata);
        }
        true
    }

    pub fn get_leader(&self) -> Option<AgentId> {
        self.inner.read().leader.clone()
    }

    /// Deterministic election: highest `health × reliability − workload`,
    /// ties broken by lowest id. In hierarchical and centralized
    /// topologies the winner also takes the hub role.
    pub fn elect_leader(&self) -> Option<AgentId> {
        let mut inner = self.inner.write();
        self.elect_locked(&mut inner)
    }

    fn elect_locked(&self, inner: &mut Inner) -> Option<AgentId> {
        let winner = inner
            .nodes
            .values()
            .filter(|n| n.status != NodeStatus::Offline)
            .map(|n| (n.agent_id.clone(), n.score.composite()))
            .max_by(|(a_id, a_score), (b_id, b_score)| {
                a_score
                    .partial_cmp(b_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Lowest id wins a tie, so it must compare greater here.
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| id)?;

        let hub_role = match self.config.kind {
            TopologyKind::Hierarchical => Some(NodeRole::Queen),
            TopologyKind::Centralized => Some(NodeRole::Coordinator),
            _ => None,
        };
        if let Some(hub_role) = hub_role {
            let previous = inner.leader.clone();
            if let Some(previous) = previous.filter(|p| p != &winner) {
                if let Some(node) = inner.nodes.get_mut(&previous) {
                    node.role = NodeRole::Worker;
                }
            }
            if let Some(node) = inner.nodes.get_mut(&winner) {
                node.role = hub_role;
            }
        }
        inner.leader = Some(winner.clone());
        info!(leader = %winner, "leader elected");
        Some(winner)
    }

    /// Neighbours reachable over installed edges.
    pub fn get_neighbors(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let inner = self.inner.read();
        inner
            .nodes
            .get(agent_id)
            .map(|n| {
                let mut neighbors: Vec<_> = n.connections.iter().cloned().collect();
                neighbors.sort();
                neighbors
            })
            .unwrap_or_default()
    }

    /// Cheapest path from `from` to `to` over edge costs (latency when
    /// measured, declared weight otherwise). Returns the node sequence
    /// including both endpoints, or `None` when unreachable.
    pub fn find_optimal_path(&self, from: &AgentId, to: &AgentId) -> Option<Vec<AgentId>> {
        let inner = self.inner.read();
        if !inner.nodes.contains_key(from) || !inner.nodes.contains_key(to) {
            return None;
        }

        let mut graph = DiGraph::<AgentId, f64>::new();
        let mut indices = HashMap::new();
        for id in inner.nodes.keys() {
            indices.insert(id.clone(), graph.add_node(id.clone()));
        }
        for edge in &inner.edges {
            let (a, b) = (indices[&edge.from], indices[&edge.to]);
            graph.add_edge(a, b, edge.cost());
            if edge.bidirectional {
                graph.add_edge(b, a, edge.cost());
            }
        }

        let goal = indices[to];
        let (_, path) = astar(
            &graph,
            indices[from],
            |node| node == goal,
            |e| *e.weight(),
            |_| 0.0,
        )?;
        Some(path.into_iter().map(|i| graph[i].clone()).collect())
    }

    /// Equalise partition sizes and re-seat partition leaders on the least
    /// loaded members. Nodes currently busy or draining are not moved.
    /// Returns the number of nodes rehomed.
    pub fn rebalance(&self) -> usize {
        let mut inner = self.inner.write();
        if inner.partitions.len() < 2 {
            return 0;
        }

        let mut moves = 0;
        loop {
            let (largest, smallest) = {
                let mut sizes: Vec<(usize, usize)> = inner
                    .partitions
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (i, p.len()))
                    .collect();
                sizes.sort_by_key(|&(_, len)| len);
                let smallest = sizes.first().copied().unwrap();
                let largest = sizes.last().copied().unwrap();
                if largest.1 <= smallest.1 + 1 {
                    break;
                }
                (largest.0, smallest.0)
            };

            // Pick a movable replica out of the largest partition.
            let candidate = inner.partitions[largest]
                .replicas
                .iter()
                .filter(|id| {
                    inner
                        .nodes
                        .get(*id)
                        .map(|n| n.status == NodeStatus::Active)
                        .unwrap_or(false)
                })
                .min()
                .cloned();
            let Some(candidate) = candidate else { break };
            inner.partitions[largest].replicas.remove(&candidate);
            inner.partitions[smallest].replicas.insert(candidate);
            moves += 1;
        }

        // Re-seat each partition leader on the highest-scoring member.
        for i in 0..inner.partitions.len() {
            let best = inner.partitions[i]
                .members()
                .filter_map(|id| inner.nodes.get(id))
                .max_by(|a, b| {
                    a.score
                        .composite()
                        .partial_cmp(&b.score.composite())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.agent_id.cmp(&a.agent_id))
                })
                .map(|n| n.agent_id.clone());
            if let Some(best) = best {
                let partition = &mut inner.partitions[i];
                if partition.leader != best {
                    let old = std::mem::replace(&mut partition.leader, best.clone());
                    partition.replicas.remove(&best);
                    partition.replicas.insert(old);
                }
            }
        }

        if moves > 0 {
            self.rebuild_hybrid_edges(&mut inner);
            info!(moves, "topology rebalanced");
        }
        moves
    }

    /// Immutable snapshot of nodes, edges, partitions and leader.
    pub fn get_state(&self) -> TopologyState {
        let inner = self.inner.read();
        let mut nodes: Vec<_> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        TopologyState {
            kind: self.config.kind,
            nodes,
            edges: inner.edges.clone(),
            partitions: inner.partitions.clone(),
            leader: inner.leader.clone(),
        }
    }

    fn add_mesh_node(&self, inner: &mut Inner, agent_id: AgentId) -> NodeRole {
        let peers: Vec<AgentId> = inner.nodes.keys().cloned().collect();
        let node = TopologyNode::new(agent_id.clone(), NodeRole::Peer);
        inner.nodes.insert(agent_id.clone(), node);
        for peer in peers {
            Self::install_edge(inner, TopologyEdge::symmetric(agent_id.clone(), peer));
        }
        if inner.leader.is_none() {
            inner.leader = Some(agent_id);
        }
        NodeRole::Peer
    }

    fn add_hub_node(
        &self,
        inner: &mut Inner,
        agent_id: AgentId,
        requested: Option<NodeRole>,
        hub_role: NodeRole,
    ) -> NodeRole {
        let hub = inner
            .nodes
            .values()
            .find(|n| n.role == hub_role)
            .map(|n| n.agent_id.clone());
        match hub {
            None => {
                // First insert: this node becomes the hub.
                inner
                    .nodes
                    .insert(agent_id.clone(), TopologyNode::new(agent_id.clone(), hub_role));
                inner.leader = Some(agent_id);
                hub_role
            }
            Some(hub) => {
                let role = requested.unwrap_or(NodeRole::Worker);
                inner
                    .nodes
                    .insert(agent_id.clone(), TopologyNode::new(agent_id.clone(), role));
                Self::install_edge(inner, TopologyEdge::symmetric(agent_id, hub));
                role
            }
        }
    }

    fn add_hybrid_node(
        &self,
        inner: &mut Inner,
        agent_id: AgentId,
        requested: Option<NodeRole>,
    ) -> NodeRole {
        let role = requested.unwrap_or(NodeRole::Peer);
        inner
            .nodes
            .insert(agent_id.clone(), TopologyNode::new(agent_id.clone(), role));

        let open: Vec<usize> = inner
            .partitions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.len() < self.config.replication_factor)
            .map(|(i, _)| i)
            .collect();

        if open.is_empty() {
            // New partition led by this node, linked to the global leader.
            inner.partitions.push(Partition {
                id: Uuid::new_v4(),
                leader: agent_id.clone(),
                replicas: Default::default(),
            });
            match inner.leader.clone() {
                Some(global) => {
                    Self::install_edge(inner, TopologyEdge::symmetric(agent_id, global));
                }
                None => inner.leader = Some(agent_id),
            }
        } else {
            let slot = match self.config.partition_strategy {
                PartitionStrategy::RoundRobin => {
                    let slot = open[inner.round_robin % open.len()];
                    inner.round_robin += 1;
                    slot
                }
                PartitionStrategy::Hash => {
                    open[(agent_id.id.as_u128() % open.len() as u128) as usize]
                }
                PartitionStrategy::Range => *open.last().unwrap(),
            };
            let members: Vec<AgentId> = inner.partitions[slot].members().cloned().collect();
            inner.partitions[slot].replicas.insert(agent_id.clone());
            // Mesh within the partition.
            for member in members {
                Self::install_edge(inner, TopologyEdge::symmetric(agent_id.clone(), member));
            }
        }
        role
    }

    fn install_edge(inner: &mut Inner, edge: TopologyEdge) {
        if let Some(node) = inner.nodes.get_mut(&edge.from) {
            node.connections.insert(edge.to.clone());
        }
        if edge.bidirectional {
            if let Some(node) = inner.nodes.get_mut(&edge.to) {
                node.connections.insert(edge.from.clone());
            }
        }
        inner.edges.push(edge);
    }

    /// Drop and reinstall hybrid edges after partition membership changed.
    fn rebuild_hybrid_edges(&self, inner: &mut Inner) {
        inner.edges.clear();
        for node in inner.nodes.values_mut() {
            node.connections.clear();
        }
        let partitions = inner.partitions.clone();
        let global = inner.leader.clone();
        for partition in &partitions {
            let members: Vec<AgentId> = partition.members().cloned().collect();
            for (i, a) in members.iter().enumerate() {
                for b in members.iter().skip(i + 1) {
                    Self::install_edge(inner, TopologyEdge::symmetric(a.clone(), b.clone()));
                }
            }
            if let Some(global) = &global {
                if &partition.leader != global {
                    Self::install_edge(
                        inner,
                        TopologyEdge::symmetric(partition.leader.clone(), global.clone()),
                    );
                }
            }
        }
    }
}
