//! # Waggle Consensus
//!
//! Pluggable consensus for swarm decisions: a proposal is broadcast to the
//! membership, votes are applied in arrival order, and a quorum rule —
//! raft-style threshold, confidence-weighted byzantine, or epidemic gossip —
//! decides acceptance. Every proposal resolves exactly once: by quorum, by
//! rejection when the timeout lapses without one, or by expiry when the
//! engine shuts down with the proposal still in flight.

pub mod byzantine;
pub mod engine;
pub mod gossip;
pub mod raft;
pub mod types;

pub use engine::{select_optimal_algorithm, ConsensusConfig, ConsensusEngine, ConsensusStats};
pub use types::{no_consensus_value, ConsensusOutcome, Proposal, ProposalStatus, Verdict, Vote};
