//! Consensus artefacts: proposals, votes and outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use waggle_core::AgentId;

/// Resolution state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

/// A single member's vote on a proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter: AgentId,
    pub approve: bool,
    /// Voter confidence in [0, 1]; weighs the vote under byzantine rules.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

impl Vote {
    pub fn approve(voter: AgentId) -> Self {
        Self {
            voter,
            approve: true,
            confidence: 1.0,
            timestamp: Utc::now(),
            reason: None,
        }
    }

    pub fn reject(voter: AgentId, reason: impl Into<String>) -> Self {
        Self {
            voter,
            approve: false,
            confidence: 1.0,
            timestamp: Utc::now(),
            reason: Some(reason.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// A value under decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub proposer: AgentId,
    pub value: serde_json::Value,
    /// Monotonic term; the proposer leads the proposal for its term.
    pub term: u64,
    pub timestamp: DateTime<Utc>,
    pub votes: HashMap<AgentId, Vote>,
    pub status: ProposalStatus,
    /// Completed gossip rounds; stays 0 under raft and byzantine rules.
    pub rounds: u32,
}

impl Proposal {
    pub fn new(proposer: AgentId, value: serde_json::Value, term: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposer,
            value,
            term,
            timestamp: Utc::now(),
            votes: HashMap::new(),
            status: ProposalStatus::Pending,
            rounds: 0,
        }
    }

    pub fn approvals(&self) -> usize {
        self.votes.values().filter(|v| v.approve).count()
    }

    pub fn rejections(&self) -> usize {
        self.votes.values().filter(|v| !v.approve).count()
    }

    /// Confidence-weighted approval mass.
    pub fn weighted_approvals(&self) -> f64 {
        self.votes
            .values()
            .filter(|v| v.approve)
            .map(|v| v.confidence)
            .sum()
    }
}

/// Decision a quorum rule reaches for a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not decidable yet; keep collecting votes.
    Pending,
    Accepted,
    Rejected,
}

/// Final outcome of a consensus round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub proposal_id: Uuid,
    pub approved: bool,
    /// Approval votes over total membership.
    pub approval_rate: f64,
    /// Votes cast over total membership.
    pub participation_rate: f64,
    /// The proposed value when accepted, the no-consensus sentinel otherwise.
    pub final_value: serde_json::Value,
    pub rounds: u32,
    pub duration_ms: u64,
}

/// Sentinel value returned when no consensus was reached.
pub fn no_consensus_value() -> serde_json::Value {
    serde_json::Value::String("no-consensus".into())
}
