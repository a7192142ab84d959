//! The consensus engine: membership, proposal lifecycle, resolution

use crate::{
    byzantine::ByzantineRule,
    gossip::GossipRule,
    raft::RaftRule,
    types::{no_consensus_value, ConsensusOutcome, Proposal, ProposalStatus, Verdict, Vote},
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{watch, Notify},
    time::interval,
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waggle_core::{
    AgentId, ConsensusAlgorithmKind, EventBus, EventKind, SwarmError, SwarmEvent, SwarmResult,
    TopologyKind,
};

/// Configuration of the consensus engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsensusConfig {
    pub algorithm: ConsensusAlgorithmKind,
    /// Fraction of the membership whose approval accepts a proposal.
    pub threshold: f64,
    pub timeout_ms: u64,
    /// Gossip rounds before a proposal is abandoned.
    pub max_rounds: u32,
    pub require_quorum: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            algorithm: ConsensusAlgorithmKind::Raft,
            threshold: waggle_core::DEFAULT_CONSENSUS_THRESHOLD,
            timeout_ms: waggle_core::DEFAULT_CONSENSUS_TIMEOUT_MS,
            max_rounds: 10,
            require_quorum: true,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(SwarmError::Configuration(format!(
                "consensus.threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SwarmError::Configuration(
                "consensus.timeoutMs must be positive".into(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(SwarmError::Configuration(
                "consensus.maxRounds must be positive".into(),
            ));
        }
        if self.algorithm == ConsensusAlgorithmKind::Paxos {
            return Err(SwarmError::Configuration(
                "consensus algorithm 'paxos' is reserved and not implemented".into(),
            ));
        }
        Ok(())
    }
}

/// Rule deciding when a proposal is settled. Evaluated after every vote,
/// every gossip round, and on expiry.
pub trait QuorumRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn evaluate(&self, proposal: &Proposal, membership: usize, config: &ConsensusConfig) -> Verdict;
}

fn rule_for(algorithm: ConsensusAlgorithmKind) -> Box<dyn QuorumRule> {
    match algorithm {
        ConsensusAlgorithmKind::Raft => Box::new(RaftRule),
        ConsensusAlgorithmKind::Byzantine => Box::new(ByzantineRule),
        ConsensusAlgorithmKind::Gossip => Box::new(GossipRule),
        // Rejected by validate(); unreachable in a constructed engine.
        ConsensusAlgorithmKind::Paxos => Box::new(RaftRule),
    }
}

/// Pick the algorithm best suited to a topology and membership size.
pub fn select_optimal_algorithm(
    topology: TopologyKind,
    membership: usize,
) -> ConsensusAlgorithmKind {
    match topology {
        TopologyKind::Mesh => ConsensusAlgorithmKind::Gossip,
        TopologyKind::Hierarchical | TopologyKind::Centralized => ConsensusAlgorithmKind::Raft,
        TopologyKind::Hybrid => {
            if membership >= 7 {
                ConsensusAlgorithmKind::Byzantine
            } else {
                ConsensusAlgorithmKind::Raft
            }
        }
    }
}

/// Aggregate consensus statistics.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsensusStats {
    pub proposals: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub expired: u64,
    /// EWMA of resolution success.
    pub success_rate: f64,
}

impl Default for ConsensusStats {
    fn default() -> Self {
        Self {
            proposals: 0,
            accepted: 0,
            rejected: 0,
            expired: 0,
            success_rate: 1.0,
        }
    }
}

const SUCCESS_RATE_ALPHA: f64 = 0.1;

struct ProposalSlot {
    proposal: Proposal,
    resolved: watch::Sender<Option<ConsensusOutcome>>,
    started: Instant,
}

/// Drives proposals to exactly one resolution each.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    rule: Box<dyn QuorumRule>,
    members: RwLock<BTreeSet<AgentId>>,
    term: AtomicU64,
    proposals: DashMap<Uuid, ProposalSlot>,
    events: Arc<EventBus>,
    stats: Mutex<ConsensusStats>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl ConsensusEngine {
    pub fn new(config: ConsensusConfig, events: Arc<EventBus>) -> SwarmResult<Self> {
        config.validate()?;
        let rule = rule_for(config.algorithm);
        Ok(Self {
            config,
            rule,
            members: RwLock::new(BTreeSet::new()),
            term: AtomicU64::new(0),
            proposals: DashMap::new(),
            events,
            stats: Mutex::new(ConsensusStats::default()),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn algorithm(&self) -> ConsensusAlgorithmKind {
        self.config.algorithm
    }

    pub fn timeout_ms(&self) -> u64 {
        self.config.timeout_ms
    }

    /// Start the expiry/round loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.expiry_loop().await;
        });
        debug!(algorithm = self.rule.name(), "consensus engine started");
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }

    /// Add a member to the voting set. Re-evaluates pending proposals since
    /// the quorum denominator changed.
    pub fn add_node(&self, id: AgentId) {
        self.members.write().insert(id);
        self.reevaluate_all();
    }

    /// Remove a member. Idempotent; re-evaluates pending proposals.
    pub fn remove_node(&self, id: &AgentId) {
        self.members.write().remove(id);
        self.reevaluate_all();
    }

    pub fn membership(&self) -> usize {
        self.members.read().len()
    }

    pub fn members(&self) -> Vec<AgentId> {
        self.members.read().iter().cloned().collect()
    }

    /// Open a proposal for the next term.
    pub fn propose(&self, value: serde_json::Value, proposer: AgentId) -> SwarmResult<Proposal> {
        let term = self.term.fetch_add(1, Ordering::SeqCst) + 1;
        let proposal = Proposal::new(proposer, value, term);
        let (resolved, _) = watch::channel(None);
        self.events.emit(SwarmEvent::new(
            EventKind::ConsensusProposed,
            "consensus",
            json!({
                "proposal_id": proposal.id,
                "term": term,
                "value": proposal.value,
            }),
        ));
        self.stats.lock().proposals += 1;
        if self.config.algorithm == ConsensusAlgorithmKind::Gossip {
            let members = self.members();
            let targets =
                crate::gossip::sample_peers(&members, &proposal.proposer, crate::gossip::DEFAULT_FANOUT);
            debug!(proposal = %proposal.id, fanout = targets.len(), "gossip round 0 seeded");
        }
        let stored = proposal.clone();
        self.proposals.insert(
            proposal.id,
            ProposalSlot {
                proposal: stored,
                resolved,
                started: Instant::now(),
            },
        );
        info!(proposal = %proposal.id, term, "proposal opened");
        Ok(proposal)
    }

    /// Apply a vote. Votes for resolved proposals are ignored; votes from
    /// the same voter replace their earlier vote.
    pub fn vote(&self, proposal_id: Uuid, vote: Vote) -> SwarmResult<()> {
        let membership = self.membership();
        let Some(mut slot) = self.proposals.get_mut(&proposal_id) else {
            return Err(SwarmError::UnknownEntity {
                entity: "proposal",
                id: proposal_id.to_string(),
            });
        };
        if slot.proposal.status.is_resolved() {
            debug!(proposal = %proposal_id, voter = %vote.voter, "vote after resolution ignored");
            return Ok(());
        }
        slot.proposal.votes.insert(vote.voter.clone(), vote);
        let verdict = self
            .rule
            .evaluate(&slot.proposal, membership, &self.config);
        self.apply_verdict(&mut slot, membership, verdict);
        Ok(())
    }

    /// Await the resolution of a proposal.
    pub async fn await_consensus(&self, proposal_id: Uuid) -> SwarmResult<ConsensusOutcome> {
        let mut rx = {
            let Some(slot) = self.proposals.get(&proposal_id) else {
                return Err(SwarmError::UnknownEntity {
                    entity: "proposal",
                    id: proposal_id.to_string(),
                });
            };
            slot.resolved.subscribe()
        };
        if let Some(outcome) = rx.borrow().clone() {
            return Ok(outcome);
        }
        // The expiry loop guarantees resolution by timeout; the outer bound
        // is a backstop against a stopped engine.
        let backstop = Duration::from_millis(self.config.timeout_ms * 2 + 1_000);
        tokio::time::timeout(backstop, async {
            loop {
                rx.changed().await.map_err(|_| SwarmError::ConsensusFailure(
                    "proposal dropped before resolution".into(),
                ))?;
                if let Some(outcome) = rx.borrow().clone() {
                    return Ok(outcome);
                }
            }
        })
        .await
        .map_err(|_| SwarmError::Timeout {
            operation: format!("await_consensus({proposal_id})"),
            elapsed_ms: self.config.timeout_ms * 2 + 1_000,
        })?
    }

    pub fn get_proposal(&self, proposal_id: Uuid) -> Option<Proposal> {
        self.proposals.get(&proposal_id).map(|s| s.proposal.clone())
    }

    /// Proposals still collecting votes.
    pub fn active_proposals(&self) -> Vec<Proposal> {
        self.proposals
            .iter()
            .filter(|s| !s.proposal.status.is_resolved())
            .map(|s| s.proposal.clone())
            .collect()
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats.lock().clone()
    }

    /// Expire every in-flight proposal without a decision; used during
    /// shutdown. This is the only path that produces `Expired`.
    pub fn cancel_all(&self) {
        let membership = self.membership();
        for mut slot in self.proposals.iter_mut() {
            if !slot.proposal.status.is_resolved() {
                self.resolve(&mut slot, membership, ProposalStatus::Expired);
            }
        }
    }

    fn reevaluate_all(&self) {
        let membership = self.membership();
        for mut slot in self.proposals.iter_mut() {
            if slot.proposal.status.is_resolved() {
                continue;
            }
            let verdict = self
                .rule
                .evaluate(&slot.proposal, membership, &self.config);
            self.apply_verdict(&mut slot, membership, verdict);
        }
    }

    fn apply_verdict(&self, slot: &mut ProposalSlot, membership: usize, verdict: Verdict) {
        match verdict {
            Verdict::Pending => {}
            Verdict::Accepted => self.resolve(slot, membership, ProposalStatus::Accepted),
            Verdict::Rejected => self.resolve(slot, membership, ProposalStatus::Rejected),
        }
    }

    /// The single point where a proposal becomes immutable.
    fn resolve(&self, slot: &mut ProposalSlot, membership: usize, status: ProposalStatus) {
        debug_assert!(!slot.proposal.status.is_resolved());
        slot.proposal.status = status;
        let approved = status == ProposalStatus::Accepted;
        let denominator = membership.max(1) as f64;
        let outcome = ConsensusOutcome {
            proposal_id: slot.proposal.id,
            approved,
            approval_rate: slot.proposal.approvals() as f64 / denominator,
            participation_rate: slot.proposal.votes.len() as f64 / denominator,
            final_value: if approved {
                slot.proposal.value.clone()
            } else {
                no_consensus_value()
            },
            rounds: slot.proposal.rounds.max(1),
            duration_ms: slot.started.elapsed().as_millis() as u64,
        };

        {
            let mut stats = self.stats.lock();
            match status {
                ProposalStatus::Accepted => stats.accepted += 1,
                ProposalStatus::Rejected => stats.rejected += 1,
                ProposalStatus::Expired => stats.expired += 1,
                ProposalStatus::Pending => unreachable!(),
            }
            let sample = if approved { 1.0 } else { 0.0 };
            stats.success_rate =
                SUCCESS_RATE_ALPHA * sample + (1.0 - SUCCESS_RATE_ALPHA) * stats.success_rate;
        }

        let kind = if approved {
            EventKind::ConsensusAchieved
        } else {
            EventKind::ConsensusFailed
        };
        self.events.emit(SwarmEvent::new(
            kind,
            "consensus",
            json!({
                "proposal_id": slot.proposal.id,
                "status": slot.proposal.status,
                "approval_rate": outcome.approval_rate,
                "final_value": outcome.final_value,
            }),
        ));
        info!(
            proposal = %slot.proposal.id,
            ?status,
            approval_rate = outcome.approval_rate,
            "proposal resolved"
        );
        let _ = slot.resolved.send(Some(outcome));
    }

    async fn expiry_loop(self: Arc<Self>) {
        let tick_ms = (self.config.timeout_ms / 20).clamp(5, 250);
        let mut ticker = interval(Duration::from_millis(tick_ms));
        let round_ms = (self.config.timeout_ms / self.config.max_rounds as u64).max(1);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.advance_time(round_ms);
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    /// Advance gossip rounds and reject proposals that outlived their
    /// timeout without reaching quorum.
    fn advance_time(&self, round_ms: u64) {
        let membership = self.membership();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        for mut slot in self.proposals.iter_mut() {
            if slot.proposal.status.is_resolved() {
                continue;
            }
            let elapsed = slot.started.elapsed();
            if self.config.algorithm == ConsensusAlgorithmKind::Gossip {
                let rounds = (elapsed.as_millis() as u64 / round_ms) as u32;
                if rounds > slot.proposal.rounds {
                    slot.proposal.rounds = rounds.min(self.config.max_rounds);
                    let verdict = self
                        .rule
                        .evaluate(&slot.proposal, membership, &self.config);
                    self.apply_verdict(&mut slot, membership, verdict);
                    if slot.proposal.status.is_resolved() {
                        continue;
                    }
                }
            }
            if elapsed >= timeout {
                warn!(proposal = %slot.proposal.id, "proposal timed out; rejecting");
                self.resolve(&mut slot, membership, ProposalStatus::Rejected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_core::{AgentKind, IdAllocator};

    fn engine_with(config: ConsensusConfig) -> (Arc<ConsensusEngine>, Vec<AgentId>) {
        let events = Arc::new(EventBus::new());
        let engine = Arc::new(ConsensusEngine::new(config, events).unwrap());
        let alloc = IdAllocator::new(Uuid::new_v4());
        let members: Vec<AgentId> = (0..3).map(|_| alloc.agent_id(AgentKind::Worker)).collect();
        for m in &members {
            engine.add_node(m.clone());
        }
        (engine, members)
    }

    #[tokio::test]
    async fn accepted_with_two_of_three_approvals() {
        let (engine, members) = engine_with(ConsensusConfig {
            timeout_ms: 500,
            ..ConsensusConfig::default()
        });
        engine.start();
        let proposal = engine
            .propose(json!("v"), members[0].clone())
            .unwrap();
        engine
            .vote(proposal.id, Vote::approve(members[0].clone()))
            .unwrap();
        engine
            .vote(proposal.id, Vote::approve(members[1].clone()))
            .unwrap();
        let outcome = engine.await_consensus(proposal.id).await.unwrap();
        assert!(outcome.approved);
        assert!((outcome.approval_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(outcome.final_value, json!("v"));
        engine.stop();
    }

    #[tokio::test]
    async fn silence_times_out_into_rejection() {
        let (engine, members) = engine_with(ConsensusConfig {
            timeout_ms: 100,
            ..ConsensusConfig::default()
        });
        engine.start();
        let before = engine.stats().success_rate;
        let proposal = engine.propose(json!("v"), members[0].clone()).unwrap();
        let outcome = engine.await_consensus(proposal.id).await.unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.final_value, no_consensus_value());
        assert_eq!(
            engine.get_proposal(proposal.id).unwrap().status,
            ProposalStatus::Rejected
        );
        assert!(engine.stats().success_rate < before);
        engine.stop();
    }

    #[tokio::test]
    async fn shutdown_expires_in_flight_proposals() {
        let (engine, members) = engine_with(ConsensusConfig {
            timeout_ms: 30_000,
            ..ConsensusConfig::default()
        });
        let proposal = engine.propose(json!("v"), members[0].clone()).unwrap();
        engine.cancel_all();
        assert_eq!(
            engine.get_proposal(proposal.id).unwrap().status,
            ProposalStatus::Expired
        );
        assert!(engine.active_proposals().is_empty());
    }

    #[tokio::test]
    async fn votes_after_resolution_are_ignored() {
        let (engine, members) = engine_with(ConsensusConfig {
            timeout_ms: 500,
            ..ConsensusConfig::default()
        });
        engine.start();
        let proposal = engine.propose(json!("v"), members[0].clone()).unwrap();
        engine
            .vote(proposal.id, Vote::approve(members[0].clone()))
            .unwrap();
        engine
            .vote(proposal.id, Vote::approve(members[1].clone()))
            .unwrap();
        let outcome = engine.await_consensus(proposal.id).await.unwrap();
        assert!(outcome.approved);

        // A late rejection cannot flip a resolved proposal.
        engine
            .vote(proposal.id, Vote::reject(members[2].clone(), "late"))
            .unwrap();
        let stored = engine.get_proposal(proposal.id).unwrap();
        assert_eq!(stored.status, ProposalStatus::Accepted);
        assert_eq!(stored.votes.len(), 2);
        engine.stop();
    }

    #[tokio::test]
    async fn paxos_is_rejected_at_construction() {
        let result = ConsensusEngine::new(
            ConsensusConfig {
                algorithm: ConsensusAlgorithmKind::Paxos,
                ..ConsensusConfig::default()
            },
            Arc::new(EventBus::new()),
        );
        assert!(matches!(result, Err(SwarmError::Configuration(_))));
    }

    #[tokio::test]
    async fn unknown_proposal_vote_is_an_error() {
        let (engine, members) = engine_with(ConsensusConfig::default());
        let result = engine.vote(Uuid::new_v4(), Vote::approve(members[0].clone()));
        assert!(matches!(result, Err(SwarmError::UnknownEntity { .. })));
    }

    #[test]
    fn algorithm_selection_matches_topology() {
        assert_eq!(
            select_optimal_algorithm(TopologyKind::Mesh, 5),
            ConsensusAlgorithmKind::Gossip
        );
        assert_eq!(
            select_optimal_algorithm(TopologyKind::Hierarchical, 5),
            ConsensusAlgorithmKind::Raft
        );
        assert_eq!(
            select_optimal_algorithm(TopologyKind::Hybrid, 7),
            ConsensusAlgorithmKind::Byzantine
        );
        assert_eq!(
            select_optimal_algorithm(TopologyKind::Hybrid, 4),
            ConsensusAlgorithmKind::Raft
        );
    }

    #[tokio::test]
    async fn membership_shrink_reevaluates_pending() {
        let (engine, members) = engine_with(ConsensusConfig {
            timeout_ms: 5_000,
            ..ConsensusConfig::default()
        });
        let proposal = engine.propose(json!("v"), members[0].clone()).unwrap();
        engine
            .vote(proposal.id, Vote::approve(members[0].clone()))
            .unwrap();
        // 1/3 approvals: pending. Removing a member makes it 1/2 — still
        // short. Removing another makes it 1/1 > 0.66: accepted.
        engine.remove_node(&members[2]);
        assert_eq!(
            engine.get_proposal(proposal.id).unwrap().status,
            ProposalStatus::Pending
        );
        engine.remove_node(&members[1]);
        assert_eq!(
            engine.get_proposal(proposal.id).unwrap().status,
            ProposalStatus::Accepted
        );
    }
}
