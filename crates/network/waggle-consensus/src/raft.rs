//! Raft-style threshold quorum
//!
//! The proposer acts as leader for its term; a value is accepted once
//! approval votes cover more than `threshold` of the current membership.
//! Rejection is declared as soon as the remaining unvoted members could no
//! longer lift approvals over the threshold.

use crate::{
    engine::{ConsensusConfig, QuorumRule},
    types::{Proposal, Verdict},
};

pub struct RaftRule;

impl QuorumRule for RaftRule {
    fn name(&self) -> &'static str {
        "raft"
    }

    fn evaluate(&self, proposal: &Proposal, membership: usize, config: &ConsensusConfig) -> Verdict {
        if membership == 0 {
            return Verdict::Pending;
        }
        let members = membership as f64;
        let approvals = proposal.approvals() as f64;
        if approvals / members > config.threshold {
            return Verdict::Accepted;
        }
        let uncast = membership.saturating_sub(proposal.votes.len()) as f64;
        if (approvals + uncast) / members <= config.threshold {
            return Verdict::Rejected;
        }
        Verdict::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vote;
    use uuid::Uuid;
    use waggle_core::{AgentKind, IdAllocator};

    fn proposal_with_votes(approvals: usize, rejections: usize) -> Proposal {
        let alloc = IdAllocator::new(Uuid::new_v4());
        let proposer = alloc.agent_id(AgentKind::Queen);
        let mut proposal = Proposal::new(proposer, serde_json::json!("v"), 1);
        for _ in 0..approvals {
            let voter = alloc.agent_id(AgentKind::Worker);
            proposal.votes.insert(voter.clone(), Vote::approve(voter));
        }
        for _ in 0..rejections {
            let voter = alloc.agent_id(AgentKind::Worker);
            proposal
                .votes
                .insert(voter.clone(), Vote::reject(voter, "no"));
        }
        proposal
    }

    #[test]
    fn two_of_three_passes_a_two_thirds_threshold() {
        let config = ConsensusConfig::default();
        let proposal = proposal_with_votes(2, 0);
        assert_eq!(RaftRule.evaluate(&proposal, 3, &config), Verdict::Accepted);
    }

    #[test]
    fn one_of_three_stays_pending() {
        let config = ConsensusConfig::default();
        let proposal = proposal_with_votes(1, 0);
        assert_eq!(RaftRule.evaluate(&proposal, 3, &config), Verdict::Pending);
    }

    #[test]
    fn impossible_quorum_rejects_early() {
        let config = ConsensusConfig::default();
        // Two rejections out of three: even a final approval cannot pass.
        let proposal = proposal_with_votes(0, 2);
        assert_eq!(RaftRule.evaluate(&proposal, 3, &config), Verdict::Rejected);
    }
}
