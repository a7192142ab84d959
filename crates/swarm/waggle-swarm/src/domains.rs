//! Domain routing over the fixed 15-agent hierarchy
//!
//! Agents 1..15 are grouped into five domains, each with its own pool and
//! FIFO queue. Domain assignment bypasses scoring: it acquires whatever the
//! domain pool hands out, and a release immediately pulls the next queued
//! task for that domain.

use crate::{
    coordinator::SwarmCoordinator,
    pool::{AgentPool, PoolBackend, PoolConfig},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    time::Instant,
};
use tracing::{debug, info, warn};
use waggle_core::{
    AgentId, AgentKind, AgentSpec, AgentStatus, EventKind, SwarmError, SwarmResult, TaskId,
    TaskSpec, TaskState, TaskStatus,
};

/// The five fixed domains of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Queen,
    Security,
    Core,
    Integration,
    Support,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Queen,
        Domain::Security,
        Domain::Core,
        Domain::Integration,
        Domain::Support,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Queen => "queen",
            Domain::Security => "security",
            Domain::Core => "core",
            Domain::Integration => "integration",
            Domain::Support => "support",
        }
    }

    pub fn from_str(s: &str) -> Option<Domain> {
        match s {
            "queen" => Some(Domain::Queen),
            "security" => Some(Domain::Security),
            "core" => Some(Domain::Core),
            "integration" => Some(Domain::Integration),
            "support" => Some(Domain::Support),
            _ => None,
        }
    }

    /// Hierarchy slots belonging to this domain.
    pub fn slots(&self) -> &'static [u8] {
        match self {
            Domain::Queen => &[1],
            Domain::Security => &[2, 3, 4],
            Domain::Core => &[5, 6, 7, 8, 9],
            Domain::Integration => &[10, 11, 12],
            Domain::Support => &[13, 14, 15],
        }
    }

    pub fn for_slot(slot: u8) -> Option<Domain> {
        Domain::ALL.iter().copied().find(|d| d.slots().contains(&slot))
    }

    /// Kind used when the domain pool has to grow on demand.
    fn growth_kind(&self) -> AgentKind {
        match self {
            Domain::Queen => AgentKind::Queen,
            Domain::Security => AgentKind::Analyst,
            Domain::Core => AgentKind::Coder,
            Domain::Integration => AgentKind::Coder,
            Domain::Support => AgentKind::Specialist,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot-by-slot layout of the full hierarchy.
pub const HIERARCHY_LAYOUT: [(u8, AgentKind, &str); 15] = [
    (1, AgentKind::Queen, "queen"),
    (2, AgentKind::Analyst, "security-architect"),
    (3, AgentKind::Reviewer, "security-auditor"),
    (4, AgentKind::Tester, "penetration-tester"),
    (5, AgentKind::Architect, "lead-architect"),
    (6, AgentKind::Coder, "core-coder-1"),
    (7, AgentKind::Coder, "core-coder-2"),
    (8, AgentKind::Optimizer, "optimizer"),
    (9, AgentKind::Tester, "core-tester"),
    (10, AgentKind::Coder, "integration-coder"),
    (11, AgentKind::Architect, "api-architect"),
    (12, AgentKind::Monitor, "integration-monitor"),
    (13, AgentKind::Documenter, "documenter"),
    (14, AgentKind::Researcher, "researcher"),
    (15, AgentKind::Specialist, "support-specialist"),
];

/// Per-task result of a parallel run, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelExecutionResult {
    pub task_id: Option<TaskId>,
    pub domain: Domain,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Pools, queues and membership for the five domains.
pub(crate) struct DomainRouter {
    pools: DashMap<Domain, Arc<AgentPool>>,
    queues: DashMap<Domain, Mutex<VecDeque<TaskId>>>,
    membership: DashMap<AgentId, Domain>,
}

impl DomainRouter {
    pub fn new() -> Self {
        let queues = DashMap::new();
        for domain in Domain::ALL {
            queues.insert(domain, Mutex::new(VecDeque::new()));
        }
        Self {
            pools: DashMap::new(),
            queues,
            membership: DashMap::new(),
        }
    }

    pub fn pool(&self, domain: Domain) -> Option<Arc<AgentPool>> {
        self.pools.get(&domain).map(|p| p.clone())
    }

    pub fn member_domain(&self, id: &AgentId) -> Option<Domain> {
        self.membership.get(id).map(|d| *d)
    }

    pub fn adopt_member(&self, id: AgentId, domain: Domain) {
        self.membership.insert(id, domain);
    }

    pub fn forget_member(&self, id: &AgentId) {
        if let Some((_, domain)) = self.membership.remove(id) {
            if let Some(pool) = self.pool(domain) {
                pool.remove(id);
            }
        }
    }

    /// A globally scheduled task picked a domain member: claim it in its
    /// pool so availability stays consistent.
    pub fn claim_member(&self, id: &AgentId) {
        if let Some(domain) = self.member_domain(id) {
            if let Some(pool) = self.pool(domain) {
                pool.claim(id);
            }
        }
    }

    pub fn queue_push(&self, domain: Domain, task_id: TaskId) {
        if let Some(queue) = self.queues.get(&domain) {
            queue.lock().push_back(task_id);
        }
    }

    pub fn queue_pop(&self, domain: Domain) -> Option<TaskId> {
        self.queues.get(&domain).and_then(|q| q.lock().pop_front())
    }

    pub fn queue_push_front(&self, domain: Domain, task_id: TaskId) {
        if let Some(queue) = self.queues.get(&domain) {
            queue.lock().push_front(task_id);
        }
    }

    pub fn queue_len(&self, domain: Domain) -> usize {
        self.queues.get(&domain).map(|q| q.lock().len()).unwrap_or(0)
    }

    pub fn is_populated(&self) -> bool {
        !self.membership.is_empty()
    }

    pub fn install_pool(&self, domain: Domain, pool: Arc<AgentPool>) {
        self.pools.insert(domain, pool);
    }

    /// Stop pool health loops and drop all membership; the agent states
    /// themselves are cleared by the coordinator.
    pub fn stop_pools(&self) {
        for pool in self.pools.iter() {
            pool.stop();
            pool.clear();
        }
        self.membership.clear();
        for queue in self.queues.iter() {
            queue.lock().clear();
        }
    }
}

/// Pool lifecycle seam backed by the coordinator's agent map.
struct DomainPoolBackend {
    coordinator: Weak<SwarmCoordinator>,
    domain: Domain,
}

impl PoolBackend for DomainPoolBackend {
    fn create_agent(&self, kind: AgentKind, name: &str) -> SwarmResult<AgentId> {
        let coordinator = self
            .coordinator
            .upgrade()
            .ok_or_else(|| SwarmError::HandlerFailure("coordinator dropped".into()))?;
        let instance = coordinator.agents.len() + 1;
        let id = coordinator.register_agent(AgentSpec::new(format!("{name}-{instance}"), kind))?;
        coordinator.domains.adopt_member(id.clone(), self.domain);
        coordinator.emit(
            EventKind::AgentDomainAssigned,
            json!({"agent_id": id.id, "domain": self.domain}),
        );
        Ok(id)
    }

    fn retire_agent(&self, id: &AgentId) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            let _ = coordinator.unregister_agent(id);
        }
    }

    fn heartbeat_age_ms(&self, id: &AgentId) -> Option<u64> {
        let coordinator = self.coordinator.upgrade()?;
        let agent = coordinator.agents.get(id)?;
        let age = chrono::Utc::now() - agent.last_heartbeat;
        Some(age.num_milliseconds().max(0) as u64)
    }

    fn degrade_agent(&self, id: &AgentId, amount: f64) -> f64 {
        let Some(coordinator) = self.coordinator.upgrade() else {
            return 1.0;
        };
        coordinator
            .agents
            .get_mut(id)
            .map(|mut agent| {
                agent.degrade_health(amount);
                agent.health
            })
            .unwrap_or(1.0)
    }

    fn mark_agent_status(&self, id: &AgentId, status: AgentStatus) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            if let Some(mut agent) = coordinator.agents.get_mut(id) {
                agent.status = status;
            }
        }
    }
}

impl SwarmCoordinator {
    /// Build the five domain pools. Called once from `initialize`.
    pub(crate) fn init_domain_pools(self: &Arc<Self>) {
        for domain in Domain::ALL {
            if let Some(pool) = self.domains.pool(domain) {
                // Re-initialisation after a shutdown restarts the loop.
                pool.start();
                continue;
            }
            let backend = Arc::new(DomainPoolBackend {
                coordinator: Arc::downgrade(self),
                domain,
            });
            let slots = domain.slots().len();
            let config = PoolConfig {
                min_size: 0,
                max_size: slots,
                health_check_interval_ms: self.config.health_check_interval_ms,
                ..self.config.pool.clone()
            };
            match AgentPool::new(
                domain.as_str(),
                domain.growth_kind(),
                config,
                backend,
                self.events().clone(),
            ) {
                Ok(pool) => {
                    let pool = Arc::new(pool);
                    pool.start();
                    self.domains.install_pool(domain, pool);
                }
                Err(e) => warn!(%domain, error = %e, "domain pool not created"),
            }
        }
    }

    /// Create agents 1..15 in their configured domains. Fails only when the
    /// hierarchy is already populated.
    pub fn spawn_full_hierarchy(&self) -> SwarmResult<Vec<AgentId>> {
        if self.domains.is_populated() {
            return Err(SwarmError::IllegalTransition {
                from: "hierarchy populated".into(),
                to: "spawn_full_hierarchy".into(),
            });
        }
        let mut spawned = Vec::with_capacity(HIERARCHY_LAYOUT.len());
        for (slot, kind, name) in HIERARCHY_LAYOUT {
            let domain = Domain::for_slot(slot).expect("every slot maps to a domain");
            let mut spec = AgentSpec::new(name, kind);
            let mut caps = waggle_core::AgentCapabilities::for_kind(kind);
            caps.domains.push(domain.as_str().into());
            spec.capabilities = Some(caps);
            let id = self.register_agent(spec)?;
            self.domains.adopt_member(id.clone(), domain);
            if let Some(pool) = self.domains.pool(domain) {
                pool.add(id.clone());
            }
            self.emit(
                EventKind::AgentDomainAssigned,
                json!({"agent_id": id.id, "domain": domain, "slot": slot}),
            );
            spawned.push(id);
        }
        self.emit(
            EventKind::HierarchySpawned,
            json!({"agents": spawned.iter().map(|a| a.id).collect::<Vec<_>>()}),
        );
        info!(count = spawned.len(), "full hierarchy spawned");
        Ok(spawned)
    }

    /// Submit a task bound to one domain: it only ever runs on that
    /// domain's pool, queueing when the pool is exhausted.
    pub async fn assign_task_to_domain(
        &self,
        spec: TaskSpec,
        domain: Domain,
    ) -> SwarmResult<TaskId> {
        let started = Instant::now();
        let task_id = self.store_task(spec, Some(domain.as_str()))?;
        let Some(pool) = self.domains.pool(domain) else {
            return Err(SwarmError::Configuration(format!(
                "domain pool {domain} not initialised"
            )));
        };
        match pool.acquire() {
            Some(agent_id) => {
                if let Err(e) = self.commit_assignment(&task_id, &agent_id).await {
                    pool.release(&agent_id);
                    return Err(e);
                }
            }
            None => {
                self.queue_domain_task(&task_id, domain)?;
            }
        }
        self.metrics.record_coordination_latency(started.elapsed());
        Ok(task_id)
    }

    /// Fan tasks out to their domains and settle them all, capturing
    /// individual failures. Results come back in input order.
    pub async fn execute_parallel(
        &self,
        items: Vec<(TaskSpec, Domain)>,
    ) -> SwarmResult<Vec<ParallelExecutionResult>> {
        let started = Instant::now();
        let runs = items.into_iter().map(|(spec, domain)| async move {
            let submitted = self.assign_task_to_domain(spec, domain).await;
            match submitted {
                Err(e) => ParallelExecutionResult {
                    task_id: None,
                    domain,
                    success: false,
                    output: None,
                    error: Some(e.to_string()),
                    duration_ms: 0,
                },
                Ok(task_id) => match self.await_task(&task_id).await {
                    Err(e) => ParallelExecutionResult {
                        task_id: Some(task_id),
                        domain,
                        success: false,
                        output: None,
                        error: Some(e.to_string()),
                        duration_ms: 0,
                    },
                    Ok(task) => settled_result(task_id, domain, task),
                },
            }
        });
        let results = futures::future::join_all(runs).await;
        self.emit(
            EventKind::ParallelExecutionCompleted,
            json!({
                "tasks": results.len(),
                "succeeded": results.iter().filter(|r| r.success).count(),
                "wall_clock_ms": started.elapsed().as_millis() as u64,
            }),
        );
        Ok(results)
    }

    fn queue_domain_task(&self, task_id: &TaskId, domain: Domain) -> SwarmResult<()> {
        {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| SwarmError::unknown_task(task_id))?;
            if task.status != TaskStatus::Queued {
                task.transition(TaskStatus::Queued)?;
            }
        }
        self.domains.queue_push(domain, task_id.clone());
        self.emit(
            EventKind::TaskQueued,
            json!({"task_id": task_id.id, "domain": domain}),
        );
        debug!(task = %task_id, %domain, "task queued for domain");
        Ok(())
    }

    /// Return a domain member to its pool after its task settled.
    pub(crate) fn release_to_domain(&self, agent_id: &AgentId) {
        if let Some(domain) = self.domains.member_domain(agent_id) {
            if let Some(pool) = self.domains.pool(domain) {
                pool.release(agent_id);
            }
        }
    }

    /// Drain each domain queue for as long as its pool hands out agents.
    pub(crate) async fn pump_domain_queues(&self) {
        for domain in Domain::ALL {
            loop {
                let Some(task_id) = self.domains.queue_pop(domain) else {
                    break;
                };
                let still_queued = self
                    .tasks
                    .get(&task_id)
                    .map(|t| t.status == TaskStatus::Queued)
                    .unwrap_or(false);
                if !still_queued {
                    continue;
                }
                let Some(pool) = self.domains.pool(domain) else {
                    break;
                };
                match pool.acquire() {
                    Some(agent_id) => {
                        if let Err(e) = self.commit_assignment(&task_id, &agent_id).await {
                            warn!(task = %task_id, %domain, error = %e, "domain dispatch failed");
                            pool.release(&agent_id);
                        }
                    }
                    None => {
                        self.domains.queue_push_front(domain, task_id);
                        break;
                    }
                }
            }
        }
    }

    /// Queue depth of one domain.
    pub fn domain_queue_depth(&self, domain: Domain) -> usize {
        self.domains.queue_len(domain)
    }

    /// Pool state of one domain, if initialised.
    pub fn domain_pool_state(&self, domain: Domain) -> Option<crate::pool::PoolState> {
        self.domains.pool(domain).map(|p| p.get_state())
    }
}

fn settled_result(task_id: TaskId, domain: Domain, task: TaskState) -> ParallelExecutionResult {
    let success = task.status == TaskStatus::Completed;
    ParallelExecutionResult {
        duration_ms: task.duration_ms().unwrap_or(0),
        task_id: Some(task_id),
        domain,
        success,
        output: task.output,
        error: if success {
            None
        } else {
            Some(
                task.error
                    .unwrap_or_else(|| format!("task ended as {}", task.status)),
            )
        },
    }
}
