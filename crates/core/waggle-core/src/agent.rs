//! Agent model: kinds, statuses, capabilities and live state

use crate::ids::{AgentId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Kind of agent registered with a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Coordinator,
    Researcher,
    Coder,
    Analyst,
    Architect,
    Tester,
    Reviewer,
    Optimizer,
    Documenter,
    Monitor,
    Specialist,
    Queen,
    Worker,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentKind::Coordinator => "coordinator",
            AgentKind::Researcher => "researcher",
            AgentKind::Coder => "coder",
            AgentKind::Analyst => "analyst",
            AgentKind::Architect => "architect",
            AgentKind::Tester => "tester",
            AgentKind::Reviewer => "reviewer",
            AgentKind::Optimizer => "optimizer",
            AgentKind::Documenter => "documenter",
            AgentKind::Monitor => "monitor",
            AgentKind::Specialist => "specialist",
            AgentKind::Queen => "queen",
            AgentKind::Worker => "worker",
        };
        f.write_str(s)
    }
}

/// Current status of an agent.
///
/// `Terminated` is absorbing: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Idle,
    Busy,
    Paused,
    Error,
    Offline,
    Terminating,
    Terminated,
}

impl AgentStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(self, AgentStatus::Terminated)
    }
}

/// Role of a node within the topology graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Queen,
    Worker,
    Coordinator,
    Peer,
}

/// Declared capabilities of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub code: bool,
    pub review: bool,
    pub test: bool,
    pub documentation: bool,
    pub research: bool,
    pub analysis: bool,
    pub coordination: bool,
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
    pub domains: Vec<String>,
    pub tools: Vec<String>,
    /// Maximum tasks the agent accepts concurrently.
    pub max_concurrent_tasks: usize,
    /// Memory budget in megabytes.
    pub max_memory_mb: u64,
    /// Execution time budget per task in seconds.
    pub max_execution_secs: u64,
    /// Reliability score in [0, 1].
    pub reliability: f64,
    /// Speed score in [0, 1].
    pub speed: f64,
    /// Quality score in [0, 1].
    pub quality: f64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            code: false,
            review: false,
            test: false,
            documentation: false,
            research: false,
            analysis: false,
            coordination: false,
            languages: Vec::new(),
            frameworks: Vec::new(),
            domains: Vec::new(),
            tools: Vec::new(),
            max_concurrent_tasks: 1,
            max_memory_mb: 512,
            max_execution_secs: 300,
            reliability: 1.0,
            speed: 1.0,
            quality: 1.0,
        }
    }
}

impl AgentCapabilities {
    /// Capabilities preset matching an agent kind.
    pub fn for_kind(kind: AgentKind) -> Self {
        let mut caps = Self::default();
        match kind {
            AgentKind::Coder | AgentKind::Optimizer => caps.code = true,
            AgentKind::Reviewer => caps.review = true,
            AgentKind::Tester => caps.test = true,
            AgentKind::Documenter => caps.documentation = true,
            AgentKind::Researcher => caps.research = true,
            AgentKind::Analyst => caps.analysis = true,
            AgentKind::Coordinator | AgentKind::Queen => caps.coordination = true,
            AgentKind::Architect => {
                caps.code = true;
                caps.analysis = true;
            }
            AgentKind::Monitor => caps.analysis = true,
            AgentKind::Specialist | AgentKind::Worker => {}
        }
        caps
    }
}

/// Rolling metrics kept per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetricsRecord {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Smoothed average execution time in milliseconds.
    pub avg_task_duration_ms: f64,
    /// Completed / (completed + failed), 1.0 while no task has finished.
    pub success_rate: f64,
    pub last_activity: DateTime<Utc>,
    /// Health snapshot in [0, 1], mirrors `AgentState::health`.
    pub health: f64,
}

impl Default for AgentMetricsRecord {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            messages_sent: 0,
            messages_received: 0,
            avg_task_duration_ms: 0.0,
            success_rate: 1.0,
            last_activity: Utc::now(),
            health: 1.0,
        }
    }
}

impl AgentMetricsRecord {
    const ALPHA: f64 = 0.1;

    /// Record a successful task completion.
    pub fn record_success(&mut self, duration_ms: u64) {
        self.tasks_completed += 1;
        if self.avg_task_duration_ms == 0.0 {
            self.avg_task_duration_ms = duration_ms as f64;
        } else {
            self.avg_task_duration_ms = Self::ALPHA * duration_ms as f64
                + (1.0 - Self::ALPHA) * self.avg_task_duration_ms;
        }
        self.refresh_success_rate();
        self.last_activity = Utc::now();
    }

    /// Record a failed task.
    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
        self.refresh_success_rate();
        self.last_activity = Utc::now();
    }

    fn refresh_success_rate(&mut self) {
        let total = self.tasks_completed + self.tasks_failed;
        if total > 0 {
            self.success_rate = self.tasks_completed as f64 / total as f64;
        }
    }
}

/// Registration payload: everything an agent is, minus its allocated id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub kind: AgentKind,
    #[serde(default)]
    pub capabilities: Option<AgentCapabilities>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            capabilities: None,
        }
    }
}

/// Live state of a registered agent, owned exclusively by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub capabilities: AgentCapabilities,
    pub metrics: AgentMetricsRecord,
    /// Load fraction in [0, 1].
    pub workload: f64,
    /// Health in [0, 1]: decays on missed heartbeats, rises on activity.
    pub health: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    pub connections: HashSet<AgentId>,
    pub role: Option<NodeRole>,
}

impl AgentState {
    pub fn new(id: AgentId, spec: AgentSpec) -> Self {
        let capabilities = spec
            .capabilities
            .unwrap_or_else(|| AgentCapabilities::for_kind(spec.kind));
        Self {
            id,
            name: spec.name,
            kind: spec.kind,
            status: AgentStatus::Initializing,
            capabilities,
            metrics: AgentMetricsRecord::default(),
            workload: 0.0,
            health: 1.0,
            last_heartbeat: Utc::now(),
            current_task: None,
            connections: HashSet::new(),
            role: None,
        }
    }

    /// Lower health by `amount`, clamped to [0, 1].
    pub fn degrade_health(&mut self, amount: f64) {
        self.health = (self.health - amount).max(0.0);
        self.metrics.health = self.health;
    }

    /// Raise health by `amount`, clamped to [0, 1].
    pub fn restore_health(&mut self, amount: f64) {
        self.health = (self.health + amount).min(1.0);
        self.metrics.health = self.health;
    }

    /// Record a heartbeat: refreshes the timestamp and restores health.
    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
        self.metrics.last_activity = self.last_heartbeat;
        self.restore_health(0.1);
    }

    /// An idle agent carries no task; a busy agent exactly one.
    pub fn assignment_consistent(&self) -> bool {
        match self.status {
            AgentStatus::Busy => self.current_task.is_some(),
            AgentStatus::Idle => self.current_task.is_none(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdAllocator;
    use uuid::Uuid;

    fn agent() -> AgentState {
        let alloc = IdAllocator::new(Uuid::new_v4());
        AgentState::new(
            alloc.agent_id(AgentKind::Coder),
            AgentSpec::new("coder-1", AgentKind::Coder),
        )
    }

    #[test]
    fn health_is_clamped() {
        let mut a = agent();
        for _ in 0..10 {
            a.degrade_health(0.2);
        }
        assert_eq!(a.health, 0.0);
        for _ in 0..20 {
            a.restore_health(0.1);
        }
        assert_eq!(a.health, 1.0);
    }

    #[test]
    fn success_rate_tracks_outcomes() {
        let mut m = AgentMetricsRecord::default();
        m.record_success(100);
        m.record_success(200);
        m.record_failure();
        assert!((m.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(m.avg_task_duration_ms > 0.0);
    }

    #[test]
    fn kind_presets_set_matching_flags() {
        assert!(AgentCapabilities::for_kind(AgentKind::Tester).test);
        assert!(AgentCapabilities::for_kind(AgentKind::Queen).coordination);
        assert!(!AgentCapabilities::for_kind(AgentKind::Documenter).code);
    }
}
