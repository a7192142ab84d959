//! Consensus through the coordinator: bus-driven voting and timeouts

mod common;

use common::ScriptedVoter;
use serde_json::json;
use std::sync::Arc;
use waggle_swarm::prelude::*;

fn config_with_timeout(timeout_ms: u64) -> CoordinatorConfig {
    common::init_tracing();
    let mut config = CoordinatorConfig::default();
    config.bus.processing_interval_ms = 5;
    config.consensus.timeout_ms = timeout_ms;
    config
}

fn voter_for(
    coordinator: &Arc<SwarmCoordinator>,
    id: &AgentId,
    approve: Option<bool>,
) {
    let voter = Arc::new(ScriptedVoter::new(
        coordinator.bus().clone(),
        coordinator.control_address(),
        id.clone(),
        approve,
    ));
    coordinator.subscribe_agent(id, voter);
}

#[tokio::test]
async fn two_approvals_of_three_members_accept() {
    let coordinator = SwarmCoordinator::new(config_with_timeout(500)).unwrap();
    coordinator.initialize().await.unwrap();

    let members: Vec<AgentId> = (0..3)
        .map(|i| {
            coordinator
                .register_agent(AgentSpec::new(format!("m{i}"), AgentKind::Worker))
                .unwrap()
        })
        .collect();
    voter_for(&coordinator, &members[0], Some(true));
    voter_for(&coordinator, &members[1], Some(true));
    voter_for(&coordinator, &members[2], None);

    let mut achieved = coordinator.events().subscribe(EventKind::ConsensusAchieved);

    let outcome = coordinator.propose_consensus(json!("v")).await.unwrap();
    assert!(outcome.approved);
    assert!((outcome.approval_rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(outcome.final_value, json!("v"));

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), achieved.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::ConsensusAchieved);

    // Nothing about the proposal remains in flight after resolution.
    assert!(coordinator.consensus().active_proposals().is_empty());
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn silence_rejects_the_proposal() {
    let coordinator = SwarmCoordinator::new(config_with_timeout(500)).unwrap();
    coordinator.initialize().await.unwrap();

    for i in 0..3 {
        let id = coordinator
            .register_agent(AgentSpec::new(format!("m{i}"), AgentKind::Worker))
            .unwrap();
        voter_for(&coordinator, &id, None);
    }
    let mut failed = coordinator.events().subscribe(EventKind::ConsensusFailed);
    let rate_before = coordinator.consensus_stats().success_rate;

    let outcome = coordinator.propose_consensus(json!("v")).await.unwrap();
    assert!(!outcome.approved);
    assert_eq!(outcome.final_value, json!("no-consensus"));
    assert_eq!(outcome.approval_rate, 0.0);

    let event = tokio::time::timeout(std::time::Duration::from_secs(1), failed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.data["status"], json!("rejected"));
    assert!(coordinator.consensus_stats().success_rate < rate_before);

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejections_resolve_before_the_timeout() {
    let coordinator = SwarmCoordinator::new(config_with_timeout(10_000)).unwrap();
    coordinator.initialize().await.unwrap();

    for i in 0..3 {
        let id = coordinator
            .register_agent(AgentSpec::new(format!("m{i}"), AgentKind::Worker))
            .unwrap();
        voter_for(&coordinator, &id, Some(false));
    }

    let started = std::time::Instant::now();
    let outcome = coordinator.propose_consensus(json!("v")).await.unwrap();
    assert!(!outcome.approved);
    // Two rejections make quorum impossible; no need to wait out 10s.
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
    assert!(outcome.participation_rate > 0.0);

    coordinator.shutdown().await.unwrap();
}
