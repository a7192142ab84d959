//! Federation hub: cross-swarm registry, ephemeral agents, federated votes
//!
//! The hub owns its registrations and ephemeral agents independently of any
//! coordinator's internal state. Secondary indexes by swarm and by status
//! keep cleanup proportional to the affected entries rather than the total
//! population.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Notify},
    time::interval,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waggle_consensus::ProposalStatus;
use waggle_core::{AgentKind, EventBus, EventKind, SwarmError, SwarmEvent, SwarmResult};

/// Configuration of the federation hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub max_ephemeral_agents: usize,
    pub default_ttl_ms: u64,
    pub sync_interval_ms: u64,
    pub auto_cleanup: bool,
    pub cleanup_interval_ms: u64,
    pub communication_timeout_ms: u64,
    pub enable_consensus: bool,
    /// Fraction of active swarms whose approval accepts a proposal.
    pub consensus_quorum: f64,
    pub consensus_timeout_ms: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_ephemeral_agents: 100,
            default_ttl_ms: 60_000,
            sync_interval_ms: 10_000,
            auto_cleanup: true,
            cleanup_interval_ms: 5_000,
            communication_timeout_ms: 5_000,
            enable_consensus: true,
            consensus_quorum: waggle_core::DEFAULT_CONSENSUS_THRESHOLD,
            consensus_timeout_ms: waggle_core::DEFAULT_CONSENSUS_TIMEOUT_MS,
        }
    }
}

impl FederationConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_ephemeral_agents == 0 {
            return Err(SwarmError::Configuration(
                "federation.maxEphemeralAgents must be positive".into(),
            ));
        }
        if !(self.consensus_quorum > 0.0 && self.consensus_quorum <= 1.0) {
            return Err(SwarmError::Configuration(
                "federation.consensusQuorum must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Health of a registered swarm, driven by heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Active,
    Degraded,
    Inactive,
}

/// A swarm known to the federation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmRegistration {
    pub swarm_id: Uuid,
    pub name: String,
    pub endpoint: Option<String>,
    pub capabilities: Vec<String>,
    pub max_agents: usize,
    pub current_agents: usize,
    pub status: SwarmStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Lifecycle of an ephemeral agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EphemeralStatus {
    Spawning,
    Active,
    Completing,
    Terminated,
}

impl EphemeralStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EphemeralStatus::Terminated)
    }
}

/// A time-bounded agent spawned inside a member swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralAgent {
    pub id: Uuid,
    pub swarm_id: Uuid,
    pub kind: AgentKind,
    pub task: String,
    pub status: EphemeralStatus,
    pub ttl_ms: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Options for spawning an ephemeral agent.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Target swarm; when omitted the hub picks the best eligible one.
    pub swarm_id: Option<Uuid>,
    pub kind: Option<AgentKind>,
    pub task: String,
    pub capabilities: Vec<String>,
    pub ttl_ms: Option<u64>,
    /// Await the agent's terminal state before returning.
    pub wait_for_completion: bool,
}

/// A message routed between swarms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationMessage {
    pub id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Receiving side of a registered swarm.
#[async_trait]
pub trait SwarmEndpoint: Send + Sync {
    async fn deliver(&self, message: FederationMessage) -> SwarmResult<()>;
}

#[async_trait]
impl SwarmEndpoint for tokio::sync::mpsc::UnboundedSender<FederationMessage> {
    async fn deliver(&self, message: FederationMessage) -> SwarmResult<()> {
        self.send(message)
            .map_err(|e| SwarmError::HandlerFailure(e.to_string()))
    }
}

/// A federation-wide proposal; the voters are whole swarms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationProposal {
    pub id: Uuid,
    pub proposer: Uuid,
    pub value: serde_json::Value,
    pub votes: HashMap<Uuid, bool>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

const SPAWN_DELAY: Duration = Duration::from_millis(50);

/// The federation hub.
pub struct FederationHub {
    config: FederationConfig,
    swarms: DashMap<Uuid, SwarmRegistration>,
    endpoints: DashMap<Uuid, Arc<dyn SwarmEndpoint>>,
    agents: DashMap<Uuid, EphemeralAgent>,
    agents_by_swarm: DashMap<Uuid, HashSet<Uuid>>,
    agents_by_status: DashMap<EphemeralStatus, HashSet<Uuid>>,
    agent_waiters: DashMap<Uuid, watch::Sender<EphemeralStatus>>,
    proposals: DashMap<Uuid, FederationProposal>,
    events: Arc<EventBus>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl FederationHub {
    pub fn new(config: FederationConfig, events: Arc<EventBus>) -> SwarmResult<Self> {
        config.validate()?;
        let agents_by_status = DashMap::new();
        for status in [
            EphemeralStatus::Spawning,
            EphemeralStatus::Active,
            EphemeralStatus::Completing,
            EphemeralStatus::Terminated,
        ] {
            agents_by_status.insert(status, HashSet::new());
        }
        Ok(Self {
            config,
            swarms: DashMap::new(),
            endpoints: DashMap::new(),
            agents: DashMap::new(),
            agents_by_swarm: DashMap::new(),
            agents_by_status,
            agent_waiters: DashMap::new(),
            proposals: DashMap::new(),
            events,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Start the sync and cleanup loops.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_millis(hub.config.sync_interval_ms.max(1)));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !hub.running.load(Ordering::SeqCst) {
                                break;
                            }
                            hub.degrade_stale_swarms();
                            hub.expire_overdue_proposals();
                        }
                        _ = hub.shutdown.notified() => break,
                    }
                }
            });
        }
        if self.config.auto_cleanup {
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker =
                    interval(Duration::from_millis(hub.config.cleanup_interval_ms.max(1)));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !hub.running.load(Ordering::SeqCst) {
                                break;
                            }
                            hub.cleanup_expired();
                        }
                        _ = hub.shutdown.notified() => break,
                    }
                }
            });
        }
        info!("federation hub started");
    }

    /// Stop loops, terminate every live ephemeral agent and expire every
    /// pending proposal.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let live: Vec<Uuid> = self
            .agents
            .iter()
            .filter(|a| !a.status.is_terminal())
            .map(|a| a.id)
            .collect();
        for id in live {
            let _ = self.terminate_agent(id, Some("federation shutdown".into()));
        }
        for mut proposal in self.proposals.iter_mut() {
            if proposal.status == ProposalStatus::Pending {
                proposal.status = ProposalStatus::Expired;
            }
        }
        info!("federation hub stopped");
    }

    // ------------------------------------------------------------------
    // Swarm registry
    // ------------------------------------------------------------------

    pub fn register_swarm(
        &self,
        swarm_id: Uuid,
        name: impl Into<String>,
        capabilities: Vec<String>,
        max_agents: usize,
        endpoint: Option<Arc<dyn SwarmEndpoint>>,
    ) -> SwarmRegistration {
        let registration = SwarmRegistration {
            swarm_id,
            name: name.into(),
            // In-process swarms are addressed by their id.
            endpoint: endpoint.as_ref().map(|_| format!("local://{swarm_id}")),
            capabilities,
            max_agents,
            current_agents: 0,
            status: SwarmStatus::Active,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        if let Some(endpoint) = endpoint {
            self.endpoints.insert(swarm_id, endpoint);
        }
        self.agents_by_swarm.entry(swarm_id).or_default();
        self.swarms.insert(swarm_id, registration.clone());
        self.events.emit(SwarmEvent::new(
            EventKind::FederationSwarmRegistered,
            "federation",
            json!({"swarm_id": swarm_id, "name": registration.name}),
        ));
        info!(swarm = %swarm_id, "swarm registered with federation");
        registration
    }

    /// Remove a swarm and terminate its ephemeral agents. Unknown ids are a
    /// no-op.
    pub fn unregister_swarm(&self, swarm_id: &Uuid) {
        if self.swarms.remove(swarm_id).is_none() {
            return;
        }
        self.endpoints.remove(swarm_id);
        let members = self
            .agents_by_swarm
            .remove(swarm_id)
            .map(|(_, set)| set)
            .unwrap_or_default();
        for agent_id in members {
            let _ = self.terminate_agent(agent_id, Some("swarm unregistered".into()));
        }
        self.events.emit(SwarmEvent::new(
            EventKind::FederationSwarmUnregistered,
            "federation",
            json!({"swarm_id": swarm_id}),
        ));
        info!(swarm = %swarm_id, "swarm unregistered from federation");
    }

    /// Record a heartbeat; reactivates degraded swarms and optionally
    /// refreshes the reported agent count.
    pub fn heartbeat(&self, swarm_id: &Uuid, current_agents: Option<usize>) -> SwarmResult<()> {
        let mut swarm = self.swarms.get_mut(swarm_id).ok_or(SwarmError::UnknownEntity {
            entity: "swarm",
            id: swarm_id.to_string(),
        })?;
        swarm.last_heartbeat = Utc::now();
        swarm.status = SwarmStatus::Active;
        if let Some(count) = current_agents {
            swarm.current_agents = count;
        }
        Ok(())
    }

    pub fn get_swarm(&self, swarm_id: &Uuid) -> Option<SwarmRegistration> {
        self.swarms.get(swarm_id).map(|s| s.clone())
    }

    pub fn list_swarms(&self) -> Vec<SwarmRegistration> {
        self.swarms.iter().map(|s| s.clone()).collect()
    }

    fn active_swarm_count(&self) -> usize {
        self.swarms
            .iter()
            .filter(|s| s.status == SwarmStatus::Active)
            .count()
    }

    /// One staleness step per sync tick: active swarms that missed three
    /// intervals degrade, degraded ones go inactive.
    fn degrade_stale_swarms(&self) {
        let stale_after = (3 * self.config.sync_interval_ms) as i64;
        let now = Utc::now();
        for mut swarm in self.swarms.iter_mut() {
            let age_ms = (now - swarm.last_heartbeat).num_milliseconds();
            if age_ms <= stale_after {
                continue;
            }
            swarm.status = match swarm.status {
                SwarmStatus::Active => {
                    debug!(swarm = %swarm.swarm_id, "swarm degraded");
                    SwarmStatus::Degraded
                }
                _ => SwarmStatus::Inactive,
            };
        }
    }

    // ------------------------------------------------------------------
    // Ephemeral agents
    // ------------------------------------------------------------------

    /// Spawn a time-bounded agent inside the chosen (or best eligible)
    /// swarm.
    pub async fn spawn_ephemeral_agent(
        self: &Arc<Self>,
        options: SpawnOptions,
    ) -> SwarmResult<EphemeralAgent> {
        let live = self.live_agent_count();
        if live >= self.config.max_ephemeral_agents {
            return Err(SwarmError::CapacityExceeded {
                resource: "ephemeral agents",
                current: live,
                max: self.config.max_ephemeral_agents,
            });
        }
        let swarm_id = match options.swarm_id {
            Some(id) => {
                if !self.swarms.contains_key(&id) {
                    return Err(SwarmError::UnknownEntity {
                        entity: "swarm",
                        id: id.to_string(),
                    });
                }
                id
            }
            None => self.select_swarm(&options.capabilities)?,
        };

        let ttl_ms = options.ttl_ms.unwrap_or(self.config.default_ttl_ms);
        let created_at = Utc::now();
        let agent = EphemeralAgent {
            id: Uuid::new_v4(),
            swarm_id,
            kind: options.kind.unwrap_or(AgentKind::Worker),
            task: options.task,
            status: EphemeralStatus::Spawning,
            ttl_ms,
            created_at,
            expires_at: created_at + chrono::Duration::milliseconds(ttl_ms as i64),
            completed_at: None,
            result: None,
            error: None,
        };
        let agent_id = agent.id;

        let (waiter, _) = watch::channel(EphemeralStatus::Spawning);
        self.agent_waiters.insert(agent_id, waiter);
        self.agents.insert(agent_id, agent.clone());
        self.agents_by_swarm
            .entry(swarm_id)
            .or_default()
            .insert(agent_id);
        self.index_status(agent_id, None, EphemeralStatus::Spawning);
        if let Some(mut swarm) = self.swarms.get_mut(&swarm_id) {
            swarm.current_agents += 1;
        }
        self.events.emit(SwarmEvent::new(
            EventKind::FederationAgentSpawned,
            "federation",
            json!({"agent_id": agent_id, "swarm_id": swarm_id}),
        ));
        debug!(agent = %agent_id, swarm = %swarm_id, "ephemeral agent spawning");

        // Spawning settles into active after a short startup delay.
        {
            let hub = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(SPAWN_DELAY).await;
                hub.set_agent_status(agent_id, EphemeralStatus::Active, |_| {});
            });
        }

        if options.wait_for_completion {
            self.await_agent(agent_id).await
        } else {
            Ok(agent)
        }
    }

    /// Wait for the agent's terminal state, bounded by its TTL plus the
    /// cleanup interval.
    pub async fn await_agent(&self, agent_id: Uuid) -> SwarmResult<EphemeralAgent> {
        let (ttl_ms, mut rx) = {
            let agent = self.agents.get(&agent_id).ok_or(SwarmError::UnknownEntity {
                entity: "ephemeral agent",
                id: agent_id.to_string(),
            })?;
            let rx = self
                .agent_waiters
                .get(&agent_id)
                .map(|w| w.subscribe())
                .ok_or(SwarmError::UnknownEntity {
                    entity: "ephemeral agent",
                    id: agent_id.to_string(),
                })?;
            (agent.ttl_ms, rx)
        };
        let deadline =
            Duration::from_millis(ttl_ms + self.config.cleanup_interval_ms + 1_000);
        let _ = tokio::time::timeout(deadline, async {
            loop {
                if rx.borrow().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        self.agents
            .get(&agent_id)
            .map(|a| a.clone())
            .ok_or(SwarmError::UnknownEntity {
                entity: "ephemeral agent",
                id: agent_id.to_string(),
            })
    }

    /// Mark an agent's work finished; it passes through `completing` and
    /// lands terminated with its result attached.
    pub fn complete_agent(&self, agent_id: Uuid, result: Option<serde_json::Value>) -> SwarmResult<()> {
        {
            let agent = self.agents.get(&agent_id).ok_or(SwarmError::UnknownEntity {
                entity: "ephemeral agent",
                id: agent_id.to_string(),
            })?;
            if agent.status.is_terminal() {
                return Ok(());
            }
        }
        self.set_agent_status(agent_id, EphemeralStatus::Completing, |_| {});
        self.set_agent_status(agent_id, EphemeralStatus::Terminated, move |agent| {
            agent.completed_at = Some(Utc::now());
            agent.result = result.clone();
        });
        Ok(())
    }

    /// Force-terminate an agent, recording an error. No-op when already
    /// terminated.
    pub fn terminate_agent(&self, agent_id: Uuid, error: Option<String>) -> SwarmResult<()> {
        {
            let Some(agent) = self.agents.get(&agent_id) else {
                return Ok(());
            };
            if agent.status.is_terminal() {
                return Ok(());
            }
        }
        self.set_agent_status(agent_id, EphemeralStatus::Terminated, move |agent| {
            agent.completed_at = Some(Utc::now());
            agent.error = error.clone();
        });
        self.events.emit(SwarmEvent::new(
            EventKind::FederationAgentTerminated,
            "federation",
            json!({"agent_id": agent_id}),
        ));
        Ok(())
    }

    pub fn get_agent(&self, agent_id: &Uuid) -> Option<EphemeralAgent> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    /// Agents of one swarm, via the secondary index.
    pub fn agents_for_swarm(&self, swarm_id: &Uuid) -> Vec<EphemeralAgent> {
        self.agents_by_swarm
            .get(swarm_id)
            .map(|set| {
                set.iter()
                    .filter_map(|id| self.agents.get(id).map(|a| a.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn live_agent_count(&self) -> usize {
        [
            EphemeralStatus::Spawning,
            EphemeralStatus::Active,
            EphemeralStatus::Completing,
        ]
        .iter()
        .map(|s| {
            self.agents_by_status
                .get(s)
                .map(|set| set.len())
                .unwrap_or(0)
        })
        .sum()
    }

    /// Terminate agents past their expiry. Walks only the non-terminal
    /// status indexes, so the pass is O(live agents).
    pub fn cleanup_expired(&self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        for status in [
            EphemeralStatus::Spawning,
            EphemeralStatus::Active,
            EphemeralStatus::Completing,
        ] {
            if let Some(set) = self.agents_by_status.get(&status) {
                for id in set.iter() {
                    if let Some(agent) = self.agents.get(id) {
                        if agent.expires_at <= now {
                            expired.push(*id);
                        }
                    }
                }
            }
        }
        for id in expired {
            warn!(agent = %id, "ephemeral agent expired");
            let _ = self.terminate_agent(id, Some("ttl expired".into()));
        }
    }

    // ------------------------------------------------------------------
    // Cross-swarm messaging
    // ------------------------------------------------------------------

    /// Deliver a payload to one swarm's endpoint, bounded by the
    /// communication timeout.
    pub async fn send_message(
        &self,
        from: Uuid,
        to: Uuid,
        payload: serde_json::Value,
    ) -> SwarmResult<()> {
        let endpoint = self
            .endpoints
            .get(&to)
            .map(|e| e.clone())
            .ok_or(SwarmError::UnknownEntity {
                entity: "swarm endpoint",
                id: to.to_string(),
            })?;
        let message = FederationMessage {
            id: Uuid::new_v4(),
            from,
            to,
            payload,
            timestamp: Utc::now(),
        };
        let timeout = Duration::from_millis(self.config.communication_timeout_ms);
        tokio::time::timeout(timeout, endpoint.deliver(message))
            .await
            .map_err(|_| SwarmError::Timeout {
                operation: format!("federation send to {to}"),
                elapsed_ms: self.config.communication_timeout_ms,
            })?
    }

    /// Best-effort fan-out to every active swarm except the sender.
    /// Returns how many swarms were reached.
    pub async fn broadcast(&self, from: Uuid, payload: serde_json::Value) -> usize {
        let targets: Vec<Uuid> = self
            .swarms
            .iter()
            .filter(|s| s.status == SwarmStatus::Active && s.swarm_id != from)
            .map(|s| s.swarm_id)
            .collect();
        let mut reached = 0;
        for target in targets {
            if self.send_message(from, target, payload.clone()).await.is_ok() {
                reached += 1;
            }
        }
        reached
    }

    // ------------------------------------------------------------------
    // Federated consensus
    // ------------------------------------------------------------------

    /// Open a federation-wide proposal voted on by whole swarms.
    pub fn propose(&self, proposer: Uuid, value: serde_json::Value) -> SwarmResult<FederationProposal> {
        if !self.config.enable_consensus {
            return Err(SwarmError::Configuration(
                "federation consensus is disabled".into(),
            ));
        }
        let proposal = FederationProposal {
            id: Uuid::new_v4(),
            proposer,
            value,
            votes: HashMap::new(),
            status: ProposalStatus::Pending,
            created_at: Utc::now(),
        };
        self.proposals.insert(proposal.id, proposal.clone());
        self.events.emit(SwarmEvent::new(
            EventKind::ConsensusProposed,
            "federation",
            json!({"proposal_id": proposal.id, "proposer": proposer}),
        ));
        Ok(proposal)
    }

    /// A swarm's vote. Quorum: approvals ≥ ⌈active × quorum⌉ accepts;
    /// rejections beyond `active − quorum_threshold` reject.
    pub fn vote(&self, proposal_id: Uuid, swarm_id: Uuid, approve: bool) -> SwarmResult<()> {
        let active = self.active_swarm_count();
        let mut proposal = self
            .proposals
            .get_mut(&proposal_id)
            .ok_or(SwarmError::UnknownEntity {
                entity: "proposal",
                id: proposal_id.to_string(),
            })?;
        if proposal.status != ProposalStatus::Pending {
            return Ok(());
        }
        proposal.votes.insert(swarm_id, approve);

        let quorum_threshold = (active as f64 * self.config.consensus_quorum).ceil() as usize;
        let approvals = proposal.votes.values().filter(|v| **v).count();
        let rejections = proposal.votes.len() - approvals;
        if approvals >= quorum_threshold.max(1) {
            proposal.status = ProposalStatus::Accepted;
        } else if rejections > active.saturating_sub(quorum_threshold) {
            proposal.status = ProposalStatus::Rejected;
        }
        if proposal.status != ProposalStatus::Pending {
            let kind = if proposal.status == ProposalStatus::Accepted {
                EventKind::ConsensusAchieved
            } else {
                EventKind::ConsensusFailed
            };
            self.events.emit(SwarmEvent::new(
                kind,
                "federation",
                json!({"proposal_id": proposal_id, "status": proposal.status}),
            ));
            info!(proposal = %proposal_id, status = ?proposal.status, "federation proposal resolved");
        }
        Ok(())
    }

    pub fn get_proposal(&self, proposal_id: &Uuid) -> Option<FederationProposal> {
        self.proposals.get(proposal_id).map(|p| p.clone())
    }

    fn expire_overdue_proposals(&self) {
        let now = Utc::now();
        let timeout = self.config.consensus_timeout_ms as i64;
        for mut proposal in self.proposals.iter_mut() {
            if proposal.status == ProposalStatus::Pending
                && (now - proposal.created_at).num_milliseconds() > timeout
            {
                proposal.status = ProposalStatus::Expired;
                self.events.emit(SwarmEvent::new(
                    EventKind::ConsensusFailed,
                    "federation",
                    json!({"proposal_id": proposal.id, "status": proposal.status}),
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Swarm selection: active, capabilities cover the request, and spare
    /// agent slots. Scored by free capacity minus heartbeat staleness.
    fn select_swarm(&self, required: &[String]) -> SwarmResult<Uuid> {
        let now = Utc::now();
        let mut best: Option<(f64, Uuid)> = None;
        for swarm in self.swarms.iter() {
            if swarm.status != SwarmStatus::Active {
                continue;
            }
            if swarm.current_agents >= swarm.max_agents {
                continue;
            }
            if !required
                .iter()
                .all(|needed| swarm.capabilities.iter().any(|c| c == needed))
            {
                continue;
            }
            let free_slots = (swarm.max_agents - swarm.current_agents) as f64;
            let staleness_secs = (now - swarm.last_heartbeat).num_seconds().max(0) as f64;
            let score = 5.0 * free_slots - staleness_secs / 10.0;
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, swarm.swarm_id));
            }
        }
        best.map(|(_, id)| id).ok_or_else(|| {
            SwarmError::Other(anyhow::anyhow!(
                "no eligible swarm for capabilities {required:?}"
            ))
        })
    }

    /// The single place agent status changes: keeps both secondary indexes
    /// and the waiter channel in sync.
    fn set_agent_status<F>(&self, agent_id: Uuid, to: EphemeralStatus, mutate: F)
    where
        F: Fn(&mut EphemeralAgent),
    {
        let previous = {
            let Some(mut agent) = self.agents.get_mut(&agent_id) else {
                return;
            };
            if agent.status.is_terminal() {
                return;
            }
            let previous = agent.status;
            agent.status = to;
            mutate(&mut agent);
            previous
        };
        self.index_status(agent_id, Some(previous), to);
        if to.is_terminal() {
            if let Some(agent) = self.agents.get(&agent_id) {
                if let Some(mut swarm) = self.swarms.get_mut(&agent.swarm_id) {
                    swarm.current_agents = swarm.current_agents.saturating_sub(1);
                }
            }
        }
        if let Some(waiter) = self.agent_waiters.get(&agent_id) {
            let _ = waiter.send(to);
        }
    }

    fn index_status(&self, agent_id: Uuid, from: Option<EphemeralStatus>, to: EphemeralStatus) {
        if let Some(from) = from {
            if let Some(mut set) = self.agents_by_status.get_mut(&from) {
                set.remove(&agent_id);
            }
        }
        self.agents_by_status
            .entry(to)
            .or_default()
            .insert(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<FederationHub> {
        Arc::new(
            FederationHub::new(FederationConfig::default(), Arc::new(EventBus::new())).unwrap(),
        )
    }

    #[tokio::test]
    async fn spawn_selects_the_swarm_with_most_capacity() {
        let hub = hub();
        let small = Uuid::new_v4();
        let large = Uuid::new_v4();
        hub.register_swarm(small, "small", vec!["code".into()], 2, None);
        hub.register_swarm(large, "large", vec!["code".into()], 10, None);

        let agent = hub
            .spawn_ephemeral_agent(SpawnOptions {
                capabilities: vec!["code".into()],
                task: "build".into(),
                ..SpawnOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(agent.swarm_id, large);
        assert_eq!(hub.get_swarm(&large).unwrap().current_agents, 1);
    }

    #[tokio::test]
    async fn capability_filter_excludes_unfit_swarms() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "docs-only", vec!["docs".into()], 10, None);
        let result = hub
            .spawn_ephemeral_agent(SpawnOptions {
                capabilities: vec!["code".into()],
                task: "build".into(),
                ..SpawnOptions::default()
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn spawning_settles_into_active() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);
        let agent = hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ..SpawnOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(agent.status, EphemeralStatus::Spawning);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(
            hub.get_agent(&agent.id).unwrap().status,
            EphemeralStatus::Active
        );
    }

    #[tokio::test]
    async fn completion_records_result_and_frees_capacity() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);
        let agent = hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ..SpawnOptions::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        hub.complete_agent(agent.id, Some(json!({"answer": 42})))
            .unwrap();
        let done = hub.get_agent(&agent.id).unwrap();
        assert_eq!(done.status, EphemeralStatus::Terminated);
        assert_eq!(done.result.unwrap()["answer"], 42);
        assert!(done.completed_at.is_some());
        assert_eq!(hub.get_swarm(&swarm).unwrap().current_agents, 0);
    }

    #[tokio::test]
    async fn ttl_expiry_terminates_with_error() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);
        let agent = hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ttl_ms: Some(10),
                ..SpawnOptions::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        hub.cleanup_expired();
        let done = hub.get_agent(&agent.id).unwrap();
        assert_eq!(done.status, EphemeralStatus::Terminated);
        assert_eq!(done.error.as_deref(), Some("ttl expired"));
    }

    #[tokio::test]
    async fn wait_for_completion_returns_terminal_state() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);
        let spawning = Arc::clone(&hub);
        let waiter = tokio::spawn(async move {
            spawning
                .spawn_ephemeral_agent(SpawnOptions {
                    swarm_id: Some(swarm),
                    task: "t".into(),
                    ttl_ms: Some(500),
                    wait_for_completion: true,
                    ..SpawnOptions::default()
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        let live: Vec<Uuid> = hub
            .agents_for_swarm(&swarm)
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(live.len(), 1);
        hub.complete_agent(live[0], Some(json!("ok"))).unwrap();
        let finished = waiter.await.unwrap().unwrap();
        assert_eq!(finished.status, EphemeralStatus::Terminated);
        assert_eq!(finished.result, Some(json!("ok")));
    }

    #[tokio::test]
    async fn cross_swarm_messages_reach_the_endpoint() {
        let hub = hub();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        hub.register_swarm(a, "a", vec![], 10, None);
        let registered = hub.register_swarm(b, "b", vec![], 10, Some(Arc::new(tx)));

        // The registration records where the swarm can be reached.
        assert_eq!(registered.endpoint.as_deref(), Some(format!("local://{b}").as_str()));
        assert!(hub.get_swarm(&b).unwrap().endpoint.is_some());
        assert!(hub.get_swarm(&a).unwrap().endpoint.is_none());

        hub.send_message(a, b, json!({"hello": "world"}))
            .await
            .unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.from, a);
        assert_eq!(message.payload["hello"], "world");

        // Broadcast skips the sender.
        assert_eq!(hub.broadcast(b, json!("x")).await, 0);
        assert_eq!(hub.broadcast(a, json!("x")).await, 1);
    }

    #[tokio::test]
    async fn federation_quorum_accepts_and_rejects() {
        let hub = hub();
        let swarms: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &swarms {
            hub.register_swarm(*id, "s", vec![], 10, None);
        }
        // quorum 0.66 over 3 active swarms → 2 approvals needed.
        let proposal = hub.propose(swarms[0], json!("upgrade")).unwrap();
        hub.vote(proposal.id, swarms[0], true).unwrap();
        assert_eq!(
            hub.get_proposal(&proposal.id).unwrap().status,
            ProposalStatus::Pending
        );
        hub.vote(proposal.id, swarms[1], true).unwrap();
        assert_eq!(
            hub.get_proposal(&proposal.id).unwrap().status,
            ProposalStatus::Accepted
        );

        let rejected = hub.propose(swarms[0], json!("rollback")).unwrap();
        hub.vote(rejected.id, swarms[0], false).unwrap();
        hub.vote(rejected.id, swarms[1], false).unwrap();
        assert_eq!(
            hub.get_proposal(&rejected.id).unwrap().status,
            ProposalStatus::Rejected
        );
    }

    #[tokio::test]
    async fn missed_heartbeats_degrade_then_deactivate() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);

        // Backdate the heartbeat past three sync intervals.
        let stale = Utc::now() - chrono::Duration::milliseconds(40_000);
        hub.swarms.get_mut(&swarm).unwrap().last_heartbeat = stale;

        hub.degrade_stale_swarms();
        assert_eq!(hub.get_swarm(&swarm).unwrap().status, SwarmStatus::Degraded);
        hub.degrade_stale_swarms();
        assert_eq!(hub.get_swarm(&swarm).unwrap().status, SwarmStatus::Inactive);

        // A heartbeat restores the swarm to active.
        hub.heartbeat(&swarm, Some(3)).unwrap();
        let restored = hub.get_swarm(&swarm).unwrap();
        assert_eq!(restored.status, SwarmStatus::Active);
        assert_eq!(restored.current_agents, 3);
    }

    #[tokio::test]
    async fn capacity_cap_applies_to_live_agents_only() {
        let hub = Arc::new(
            FederationHub::new(
                FederationConfig {
                    max_ephemeral_agents: 1,
                    ..FederationConfig::default()
                },
                Arc::new(EventBus::new()),
            )
            .unwrap(),
        );
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);

        let first = hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ..SpawnOptions::default()
            })
            .await
            .unwrap();
        let over = hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ..SpawnOptions::default()
            })
            .await;
        assert!(matches!(over, Err(SwarmError::CapacityExceeded { .. })));

        // Terminating the first frees the slot.
        hub.terminate_agent(first.id, None).unwrap();
        assert!(hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ..SpawnOptions::default()
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unregister_terminates_member_agents() {
        let hub = hub();
        let swarm = Uuid::new_v4();
        hub.register_swarm(swarm, "s", vec![], 10, None);
        let agent = hub
            .spawn_ephemeral_agent(SpawnOptions {
                swarm_id: Some(swarm),
                task: "t".into(),
                ..SpawnOptions::default()
            })
            .await
            .unwrap();
        hub.unregister_swarm(&swarm);
        assert!(hub.get_swarm(&swarm).is_none());
        assert_eq!(
            hub.get_agent(&agent.id).unwrap().status,
            EphemeralStatus::Terminated
        );
    }
}
