//! Byzantine quorum: confidence-weighted two-thirds majority
//!
//! Tolerates up to f ≤ (n−1)/3 faulty voters. Votes are weighted by voter
//! confidence, so a hesitant approval contributes less mass than a certain
//! one; acceptance requires the weighted approval mass to exceed 2n/3.

use crate::{
    engine::{ConsensusConfig, QuorumRule},
    types::{Proposal, Verdict},
};

pub struct ByzantineRule;

impl ByzantineRule {
    /// Maximum tolerated faulty voters for a membership of `n`.
    pub fn fault_tolerance(n: usize) -> usize {
        n.saturating_sub(1) / 3
    }
}

impl QuorumRule for ByzantineRule {
    fn name(&self) -> &'static str {
        "byzantine"
    }

    fn evaluate(&self, proposal: &Proposal, membership: usize, _config: &ConsensusConfig) -> Verdict {
        if membership == 0 {
            return Verdict::Pending;
        }
        let required = 2.0 * membership as f64 / 3.0;
        let weighted = proposal.weighted_approvals();
        if weighted > required {
            return Verdict::Accepted;
        }
        // Unvoted members can contribute at most weight 1.0 each.
        let uncast = membership.saturating_sub(proposal.votes.len()) as f64;
        if weighted + uncast <= required {
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

    fn proposal() -> (Proposal, IdAllocator) {
        let alloc = IdAllocator::new(Uuid::new_v4());
        let proposer = alloc.agent_id(AgentKind::Queen);
        (Proposal::new(proposer, serde_json::json!("v"), 1), alloc)
    }

    #[test]
    fn fault_tolerance_follows_three_f_plus_one() {
        assert_eq!(ByzantineRule::fault_tolerance(4), 1);
        assert_eq!(ByzantineRule::fault_tolerance(7), 2);
        assert_eq!(ByzantineRule::fault_tolerance(10), 3);
    }

    #[test]
    fn full_confidence_approvals_pass() {
        let config = ConsensusConfig::default();
        let (mut proposal, alloc) = proposal();
        for _ in 0..3 {
            let voter = alloc.agent_id(AgentKind::Worker);
            proposal.votes.insert(voter.clone(), Vote::approve(voter));
        }
        assert_eq!(
            ByzantineRule.evaluate(&proposal, 4, &config),
            Verdict::Accepted
        );
    }

    #[test]
    fn low_confidence_approvals_do_not_pass() {
        let config = ConsensusConfig::default();
        let (mut proposal, alloc) = proposal();
        // Three approvals at 0.5 confidence: weight 1.5, short of 2n/3 ≈ 2.67.
        for _ in 0..3 {
            let voter = alloc.agent_id(AgentKind::Worker);
            proposal
                .votes
                .insert(voter.clone(), Vote::approve(voter).with_confidence(0.5));
        }
        assert_eq!(
            ByzantineRule.evaluate(&proposal, 4, &config),
            Verdict::Pending
        );
    }

    #[test]
    fn unreachable_mass_rejects() {
        let config = ConsensusConfig::default();
        let (mut proposal, alloc) = proposal();
        for _ in 0..2 {
            let voter = alloc.agent_id(AgentKind::Worker);
            proposal
                .votes
                .insert(voter.clone(), Vote::reject(voter, "faulty"));
        }
        // Membership 3: remaining single voter cannot push mass over 2.
        assert_eq!(
            ByzantineRule.evaluate(&proposal, 3, &config),
            Verdict::Rejected
        );
    }
}
