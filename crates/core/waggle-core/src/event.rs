//! Typed event stream
//!
//! Every component emits `SwarmEvent`s after mutating its own state.
//! Consumers subscribe either to one `EventKind` or to the catch-all
//! stream; both are backed by broadcast channels, so a slow consumer only
//! loses its own backlog.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of event emitted by the swarm engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SwarmInitialized,
    SwarmStarted,
    SwarmPaused,
    SwarmResumed,
    SwarmStopped,
    SwarmFailed,
    AgentJoined,
    AgentLeft,
    AgentStatusChanged,
    AgentHeartbeat,
    AgentDomainAssigned,
    TaskCreated,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskQueued,
    TopologyUpdated,
    TopologyRebalanced,
    ConsensusProposed,
    ConsensusAchieved,
    ConsensusFailed,
    MessageSent,
    MessageReceived,
    MessageError,
    PoolExhausted,
    ParallelExecutionCompleted,
    HierarchySpawned,
    FederationSwarmRegistered,
    FederationSwarmUnregistered,
    FederationAgentSpawned,
    FederationAgentTerminated,
}

impl EventKind {
    /// Dotted name as exposed on the event stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SwarmInitialized => "swarm.initialized",
            EventKind::SwarmStarted => "swarm.started",
            EventKind::SwarmPaused => "swarm.paused",
            EventKind::SwarmResumed => "swarm.resumed",
            EventKind::SwarmStopped => "swarm.stopped",
            EventKind::SwarmFailed => "swarm.failed",
            EventKind::AgentJoined => "agent.joined",
            EventKind::AgentLeft => "agent.left",
            EventKind::AgentStatusChanged => "agent.status_changed",
            EventKind::AgentHeartbeat => "agent.heartbeat",
            EventKind::AgentDomainAssigned => "agent.domain_assigned",
            EventKind::TaskCreated => "task.created",
            EventKind::TaskAssigned => "task.assigned",
            EventKind::TaskStarted => "task.started",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskQueued => "task.queued",
            EventKind::TopologyUpdated => "topology.updated",
            EventKind::TopologyRebalanced => "topology.rebalanced",
            EventKind::ConsensusProposed => "consensus.proposed",
            EventKind::ConsensusAchieved => "consensus.achieved",
            EventKind::ConsensusFailed => "consensus.failed",
            EventKind::MessageSent => "message.sent",
            EventKind::MessageReceived => "message.received",
            EventKind::MessageError => "message.error",
            EventKind::PoolExhausted => "pool.exhausted",
            EventKind::ParallelExecutionCompleted => "parallel.execution.completed",
            EventKind::HierarchySpawned => "hierarchy.spawned",
            EventKind::FederationSwarmRegistered => "federation.swarm_registered",
            EventKind::FederationSwarmUnregistered => "federation.swarm_unregistered",
            EventKind::FederationAgentSpawned => "federation.agent_spawned",
            EventKind::FederationAgentTerminated => "federation.agent_terminated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event on the swarm event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// Component that emitted the event, e.g. `"coordinator"` or `"bus"`.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    pub correlation_id: Option<Uuid>,
}

impl SwarmEvent {
    pub fn new(kind: EventKind, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            timestamp: Utc::now(),
            data,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Multiplexed event channel: one catch-all stream plus per-kind streams.
pub struct EventBus {
    all: broadcast::Sender<SwarmEvent>,
    by_kind: DashMap<EventKind, broadcast::Sender<SwarmEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (all, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            all,
            by_kind: DashMap::new(),
        }
    }

    /// Emit an event to the catch-all stream and the per-kind stream.
    ///
    /// Emission never fails: an event with no subscribers is simply dropped.
    pub fn emit(&self, event: SwarmEvent) {
        tracing::trace!(kind = %event.kind, source = %event.source, "event");
        if let Some(sender) = self.by_kind.get(&event.kind) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> broadcast::Receiver<SwarmEvent> {
        self.all.subscribe()
    }

    /// Subscribe to one event kind.
    pub fn subscribe(&self, kind: EventKind) -> broadcast::Receiver<SwarmEvent> {
        self.by_kind
            .entry(kind)
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn per_kind_subscription_only_sees_its_kind() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(EventKind::TaskAssigned);
        bus.emit(SwarmEvent::new(
            EventKind::TaskCreated,
            "coordinator",
            json!({}),
        ));
        bus.emit(SwarmEvent::new(
            EventKind::TaskAssigned,
            "coordinator",
            json!({"task": 1}),
        ));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::TaskAssigned);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn catch_all_sees_everything() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        bus.emit(SwarmEvent::new(EventKind::SwarmStarted, "coordinator", json!({})));
        bus.emit(SwarmEvent::new(EventKind::AgentJoined, "coordinator", json!({})));
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::SwarmStarted);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::AgentJoined);
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(SwarmEvent::new(EventKind::SwarmStopped, "coordinator", json!({})));
    }
}
