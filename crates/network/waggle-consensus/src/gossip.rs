//! Gossip quorum: epidemic dissemination over bounded rounds
//!
//! The proposal spreads to a random peer sample each round. Resolution
//! happens when the approvals observed so far exceed the threshold;
//! exhausting `max_rounds` without reaching it rejects the proposal.

use crate::{
    engine::{ConsensusConfig, QuorumRule},
    types::{Proposal, Verdict},
};
use rand::seq::SliceRandom;
use waggle_core::AgentId;

/// Default peers contacted per gossip round.
pub const DEFAULT_FANOUT: usize = 3;

pub struct GossipRule;

impl QuorumRule for GossipRule {
    fn name(&self) -> &'static str {
        "gossip"
    }

    fn evaluate(&self, proposal: &Proposal, membership: usize, config: &ConsensusConfig) -> Verdict {
        if membership == 0 {
            return Verdict::Pending;
        }
        let approvals = proposal.approvals() as f64;
        if approvals / membership as f64 > config.threshold {
            return Verdict::Accepted;
        }
        if proposal.rounds >= config.max_rounds {
            return Verdict::Rejected;
        }
        Verdict::Pending
    }
}

/// Pick the peers a gossip round targets.
pub fn sample_peers(members: &[AgentId], exclude: &AgentId, fanout: usize) -> Vec<AgentId> {
    let candidates: Vec<&AgentId> = members.iter().filter(|m| *m != exclude).collect();
    candidates
        .choose_multiple(&mut rand::thread_rng(), fanout.min(candidates.len()))
        .map(|m| (*m).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vote;
    use uuid::Uuid;
    use waggle_core::{AgentKind, IdAllocator};

    #[test]
    fn exhausted_rounds_reject() {
        let config = ConsensusConfig {
            max_rounds: 5,
            ..ConsensusConfig::default()
        };
        let alloc = IdAllocator::new(Uuid::new_v4());
        let mut proposal = Proposal::new(
            alloc.agent_id(AgentKind::Worker),
            serde_json::json!("v"),
            1,
        );
        proposal.rounds = 5;
        assert_eq!(GossipRule.evaluate(&proposal, 5, &config), Verdict::Rejected);
    }

    #[test]
    fn threshold_accepts_mid_rounds() {
        let config = ConsensusConfig::default();
        let alloc = IdAllocator::new(Uuid::new_v4());
        let mut proposal = Proposal::new(
            alloc.agent_id(AgentKind::Worker),
            serde_json::json!("v"),
            1,
        );
        for _ in 0..3 {
            let voter = alloc.agent_id(AgentKind::Worker);
            proposal.votes.insert(voter.clone(), Vote::approve(voter));
        }
        proposal.rounds = 2;
        assert_eq!(GossipRule.evaluate(&proposal, 4, &config), Verdict::Accepted);
    }

    #[test]
    fn sample_never_includes_the_origin() {
        let alloc = IdAllocator::new(Uuid::new_v4());
        let members: Vec<AgentId> = (0..10).map(|_| alloc.agent_id(AgentKind::Worker)).collect();
        let origin = members[0].clone();
        for _ in 0..20 {
            let sample = sample_peers(&members, &origin, DEFAULT_FANOUT);
            assert_eq!(sample.len(), DEFAULT_FANOUT);
            assert!(!sample.contains(&origin));
        }
    }
}
