//! Swarm coordinator: the aggregate root
//!
//! Owns the agent and task maps, drives scheduling, wires the bus, the
//! topology manager and the consensus engine together, and emits the event
//! stream. Every mutation happens here; other components observe through
//! events and snapshots.

use crate::{
    config::CoordinatorConfig,
    domains::{Domain, DomainRouter},
    metrics::{CoordinatorMetrics, MetricsRegistry, PerformanceReport},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waggle_bus::{Ack, BusStats, Message, MessageBus, MessageHandler, MessageKind, MessagePriority, Recipient};
use waggle_consensus::{ConsensusEngine, ConsensusOutcome, ConsensusStats};
use waggle_core::{
    AgentId, AgentKind, AgentSpec, AgentState, AgentStatus, EventBus, EventKind, IdAllocator,
    NodeRole, SwarmError, SwarmEvent, SwarmId, SwarmResult, TaskId, TaskSpec, TaskState,
    TaskStatus,
};
use waggle_topology::{NodePatch, NodeScore, NodeStatus, TopologyManager, TopologyState};

/// Lifecycle status of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorStatus {
    Initializing,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CoordinatorStatus::Initializing => "initializing",
            CoordinatorStatus::Running => "running",
            CoordinatorStatus::Paused => "paused",
            CoordinatorStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Filters for `list_agents`.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub kind: Option<AgentKind>,
    pub status: Option<AgentStatus>,
}

/// Point-in-time view of the whole swarm.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SwarmStateSnapshot {
    pub swarm_id: SwarmId,
    pub status: CoordinatorStatus,
    pub agents: usize,
    pub idle_agents: usize,
    pub busy_agents: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub topology: TopologyState,
}

pub(crate) struct TaskWaiter {
    pub sender: watch::Sender<TaskStatus>,
}

/// The swarm coordinator.
pub struct SwarmCoordinator {
    swarm_id: SwarmId,
    pub(crate) config: CoordinatorConfig,
    status: Mutex<CoordinatorStatus>,
    pub(crate) allocator: Arc<IdAllocator>,
    pub(crate) agents: DashMap<AgentId, AgentState>,
    agent_index: DashMap<Uuid, AgentId>,
    pub(crate) tasks: DashMap<TaskId, TaskState>,
    task_index: DashMap<Uuid, TaskId>,
    queue: Mutex<VecDeque<TaskId>>,
    task_waiters: DashMap<Uuid, TaskWaiter>,
    mailboxes: DashMap<Uuid, Mutex<Option<mpsc::UnboundedReceiver<Message>>>>,
    topology: Arc<TopologyManager>,
    bus: Arc<MessageBus>,
    engine: Arc<ConsensusEngine>,
    events: Arc<EventBus>,
    pub(crate) domains: DomainRouter,
    pub(crate) metrics: MetricsRegistry,
    control_id: AgentId,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl SwarmCoordinator {
    /// Build a coordinator from a validated configuration.
    pub fn new(config: CoordinatorConfig) -> SwarmResult<Arc<Self>> {
        config.validate()?;
        let swarm_id = SwarmId::new(config.namespace.clone());
        let allocator = Arc::new(IdAllocator::new(swarm_id.id));
        let events = Arc::new(EventBus::new());
        let bus = Arc::new(MessageBus::new(config.bus.clone(), events.clone()));
        let topology = Arc::new(TopologyManager::new(config.topology.clone())?);
        let engine = Arc::new(ConsensusEngine::new(config.consensus.clone(), events.clone())?);
        let control_id = allocator.agent_id(AgentKind::Coordinator);

        let coordinator = Arc::new(Self {
            swarm_id,
            config,
            status: Mutex::new(CoordinatorStatus::Initializing),
            allocator,
            agents: DashMap::new(),
            agent_index: DashMap::new(),
            tasks: DashMap::new(),
            task_index: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
            task_waiters: DashMap::new(),
            mailboxes: DashMap::new(),
            topology,
            bus,
            engine,
            events,
            domains: DomainRouter::new(),
            metrics: MetricsRegistry::new(),
            control_id,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        });
        Ok(coordinator)
    }

    /// Start components and background loops. Legal from `Initializing` or
    /// `Stopped` only.
    pub async fn initialize(self: &Arc<Self>) -> SwarmResult<()> {
        {
            let mut status = self.status.lock();
            match *status {
                CoordinatorStatus::Initializing | CoordinatorStatus::Stopped => {
                    *status = CoordinatorStatus::Running;
                }
                other => {
                    return Err(SwarmError::IllegalTransition {
                        from: other.to_string(),
                        to: "running".into(),
                    })
                }
            }
        }
        info!(swarm = %self.swarm_id, "initializing swarm");

        self.running.store(true, Ordering::SeqCst);
        self.bus.start();
        self.engine.start();
        self.init_domain_pools();

        // Control inbox: agents report back through the bus.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.bus.subscribe(self.control_id.clone(), Arc::new(tx));
        {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if !coordinator.running.load(Ordering::SeqCst) {
                        break;
                    }
                    if message.requires_ack {
                        coordinator
                            .bus
                            .acknowledge(Ack::success(&message, coordinator.control_id.clone()));
                    }
                    coordinator.handle_message(message).await;
                }
            });
        }

        // Maintenance: heartbeat health and task deadlines.
        {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(
                    coordinator.config.heartbeat_interval_ms,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !coordinator.running.load(Ordering::SeqCst) {
                                break;
                            }
                            if coordinator.get_status() == CoordinatorStatus::Running {
                                coordinator.check_heartbeats().await;
                                coordinator.check_task_deadlines().await;
                            }
                        }
                        _ = coordinator.shutdown.notified() => break,
                    }
                }
            });
        }

        // Metrics gauges.
        {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(
                    coordinator.config.metrics_interval_ms.max(1),
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !coordinator.running.load(Ordering::SeqCst) {
                                break;
                            }
                            metrics::gauge!("waggle_agents_active")
                                .set(coordinator.active_agent_count() as f64);
                            metrics::gauge!("waggle_queue_depth")
                                .set(coordinator.queue.lock().len() as f64);
                            metrics::gauge!("waggle_bus_messages_per_second")
                                .set(coordinator.bus.stats().messages_per_second);
                        }
                        _ = coordinator.shutdown.notified() => break,
                    }
                }
            });
        }

        self.emit(EventKind::SwarmInitialized, json!({"swarm_id": self.swarm_id.id}));
        self.emit(EventKind::SwarmStarted, json!({"swarm_id": self.swarm_id.id}));
        info!(swarm = %self.swarm_id, "swarm running");
        Ok(())
    }

    /// Stop every component and clear all state. Idempotent once stopped.
    pub async fn shutdown(self: &Arc<Self>) -> SwarmResult<()> {
        {
            let mut status = self.status.lock();
            if *status == CoordinatorStatus::Stopped {
                return Ok(());
            }
            *status = CoordinatorStatus::Stopped;
        }
        info!(swarm = %self.swarm_id, "shutting down swarm");

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.engine.cancel_all();
        self.engine.stop();
        self.bus.stop();
        self.domains.stop_pools();

        self.agents.clear();
        self.agent_index.clear();
        self.tasks.clear();
        self.task_index.clear();
        self.queue.lock().clear();
        self.task_waiters.clear();
        self.mailboxes.clear();

        self.emit(EventKind::SwarmStopped, json!({"swarm_id": self.swarm_id.id}));
        Ok(())
    }

    /// Suspend background work. In-flight acks are still honoured because
    /// the bus keeps running. Illegal transitions are silent.
    pub fn pause(&self) {
        let mut status = self.status.lock();
        if *status == CoordinatorStatus::Running {
            *status = CoordinatorStatus::Paused;
            drop(status);
            self.emit(EventKind::SwarmPaused, json!({}));
            info!(swarm = %self.swarm_id, "swarm paused");
        }
    }

    /// Resume background work and kick the queue. Illegal transitions are
    /// silent.
    pub async fn resume(self: &Arc<Self>) {
        {
            let mut status = self.status.lock();
            if *status != CoordinatorStatus::Paused {
                return;
            }
            *status = CoordinatorStatus::Running;
        }
        self.emit(EventKind::SwarmResumed, json!({}));
        self.try_dispatch_queue().await;
        info!(swarm = %self.swarm_id, "swarm resumed");
    }

    pub fn get_status(&self) -> CoordinatorStatus {
        *self.status.lock()
    }

    pub fn swarm_id(&self) -> &SwarmId {
        &self.swarm_id
    }

    /// The coordinator's own address on the bus; agents report here.
    pub fn control_address(&self) -> AgentId {
        self.control_id.clone()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.engine
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Register an agent: allocate its id, join topology, subscribe a
    /// mailbox on the bus and expand consensus membership.
    pub fn register_agent(&self, spec: AgentSpec) -> SwarmResult<AgentId> {
        let started = Instant::now();
        if self.agents.len() >= self.config.max_agents {
            return Err(SwarmError::CapacityExceeded {
                resource: "agents",
                current: self.agents.len(),
                max: self.config.max_agents,
            });
        }

        let id = self.allocator.agent_id(spec.kind);
        let mut state = AgentState::new(id.clone(), spec);
        state.status = AgentStatus::Idle;

        let requested_role = match state.kind {
            AgentKind::Queen => Some(NodeRole::Queen),
            AgentKind::Coordinator => Some(NodeRole::Coordinator),
            _ => None,
        };
        let role = self.topology.add_node(id.clone(), requested_role)?;
        state.role = Some(role);

        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        self.bus.subscribe(id.clone(), Arc::new(tx));
        self.mailboxes.insert(id.id, Mutex::new(Some(rx)));

        self.engine.add_node(id.clone());
        self.agent_index.insert(id.id, id.clone());
        self.agents.insert(id.clone(), state);

        self.emit(
            EventKind::AgentJoined,
            json!({"agent_id": id.id, "kind": id.kind, "role": role}),
        );
        self.emit(
            EventKind::TopologyUpdated,
            json!({"nodes": self.topology.node_count()}),
        );
        self.metrics.record_coordination_latency(started.elapsed());
        info!(agent = %id, "agent registered");
        Ok(id)
    }

    /// Remove an agent. Its current task (if any) is cancelled first.
    /// Unknown ids are a no-op.
    pub fn unregister_agent(&self, id: &AgentId) -> SwarmResult<()> {
        let started = Instant::now();
        let Some((_, state)) = self.agents.remove(id) else {
            return Ok(());
        };
        if let Some(task_id) = state.current_task {
            self.cancel_task(&task_id)?;
        }
        self.topology.remove_node(id);
        self.bus.unsubscribe(id);
        self.engine.remove_node(id);
        self.mailboxes.remove(&id.id);
        self.agent_index.remove(&id.id);
        self.domains.forget_member(id);

        self.emit(EventKind::AgentLeft, json!({"agent_id": id.id}));
        self.emit(
            EventKind::TopologyUpdated,
            json!({"nodes": self.topology.node_count()}),
        );
        self.metrics.record_coordination_latency(started.elapsed());
        info!(agent = %id, "agent unregistered");
        Ok(())
    }

    /// Rehome partitions to even out their sizes. Returns the number of
    /// nodes moved.
    pub fn rebalance_topology(&self) -> usize {
        let moves = self.topology.rebalance();
        if moves > 0 {
            self.emit(EventKind::TopologyRebalanced, json!({"moves": moves}));
        }
        moves
    }

    /// Register an agent and optionally bind it to a domain pool.
    pub fn spawn_agent(&self, spec: AgentSpec, domain: Option<Domain>) -> SwarmResult<AgentId> {
        let id = self.register_agent(spec)?;
        if let Some(domain) = domain {
            self.domains.adopt_member(id.clone(), domain);
            if let Some(pool) = self.domains.pool(domain) {
                pool.add(id.clone());
            }
            self.emit(
                EventKind::AgentDomainAssigned,
                json!({"agent_id": id.id, "domain": domain}),
            );
        }
        Ok(id)
    }

    /// Terminate an agent: cancels its work and removes every trace of it.
    pub fn terminate_agent(&self, id: &AgentId) -> SwarmResult<()> {
        self.unregister_agent(id)
    }

    /// Replace the agent's bus subscription with an external handler.
    pub fn subscribe_agent(&self, id: &AgentId, handler: Arc<dyn MessageHandler>) {
        self.mailboxes.remove(&id.id);
        self.bus.subscribe(id.clone(), handler);
    }

    /// Take the default mailbox of an agent, if it still exists.
    pub fn take_mailbox(&self, id: &AgentId) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.mailboxes.get(&id.id).and_then(|slot| slot.lock().take())
    }

    pub fn get_agent(&self, id: &AgentId) -> Option<AgentState> {
        self.agents.get(id).map(|a| a.clone())
    }

    pub fn get_all_agents(&self) -> Vec<AgentState> {
        let mut all: Vec<AgentState> = self.agents.iter().map(|a| a.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn list_agents(&self, filter: AgentFilter) -> Vec<AgentState> {
        self.get_all_agents()
            .into_iter()
            .filter(|a| filter.kind.map_or(true, |k| a.kind == k))
            .filter(|a| filter.status.map_or(true, |s| a.status == s))
            .collect()
    }

    pub fn active_agent_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| !a.status.is_terminated())
            .count()
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Submit a task; it is assigned immediately when an idle agent exists,
    /// queued otherwise.
    pub async fn submit_task(&self, spec: TaskSpec) -> SwarmResult<TaskId> {
        let started = Instant::now();
        let task_id = self.store_task(spec, None)?;
        self.try_assign(&task_id).await?;
        self.metrics.record_coordination_latency(started.elapsed());
        Ok(task_id)
    }

    /// Create and index the task without scheduling it.
    pub(crate) fn store_task(
        &self,
        mut spec: TaskSpec,
        domain_tag: Option<&str>,
    ) -> SwarmResult<TaskId> {
        if self.tasks.len() >= self.config.max_tasks {
            return Err(SwarmError::CapacityExceeded {
                resource: "tasks",
                current: self.tasks.len(),
                max: self.config.max_tasks,
            });
        }
        if let Some(domain) = domain_tag {
            spec.metadata
                .insert("domain".into(), serde_json::Value::String(domain.into()));
        }
        let id = self.allocator.task_id(spec.priority);
        let task = TaskState::from_spec(id.clone(), spec, self.config.task_timeout_ms);
        let (sender, _) = watch::channel(TaskStatus::Created);
        self.task_waiters.insert(id.id, TaskWaiter { sender });
        self.task_index.insert(id.id, id.clone());
        self.tasks.insert(id.clone(), task);
        self.metrics.record_task_created();
        self.emit(EventKind::TaskCreated, json!({"task_id": id.id}));
        Ok(id)
    }

    /// Cancel a task: the assignee is told to stop via a high-priority
    /// ack-required message and released immediately. Unknown or terminal
    /// tasks are a no-op.
    pub fn cancel_task(&self, task_id: &TaskId) -> SwarmResult<()> {
        let started = Instant::now();
        let assignee = {
            let Some(mut task) = self.tasks.get_mut(task_id) else {
                return Ok(());
            };
            if task.status.is_terminal() {
                return Ok(());
            }
            let assignee = task.assigned_to.clone();
            task.transition(TaskStatus::Cancelled)?;
            assignee
        };
        self.notify_task_status(task_id);

        if let Some(agent_id) = assignee {
            let cancel = Message::new(
                MessageKind::TaskCancel,
                self.control_id.clone(),
                Recipient::Agent(agent_id.clone()),
                json!({"task_id": task_id.id}),
            )
            .with_priority(MessagePriority::High)
            .with_ack();
            if let Err(e) = self.bus.send(cancel) {
                warn!(task = %task_id, error = %e, "cancel notification not sent");
            }
            self.reset_agent_to_idle(&agent_id);
            self.release_to_domain(&agent_id);
        }

        self.emit(
            EventKind::TaskFailed,
            json!({"task_id": task_id.id, "reason": "cancelled"}),
        );
        self.metrics.record_coordination_latency(started.elapsed());
        debug!(task = %task_id, "task cancelled");
        Ok(())
    }

    pub fn get_task(&self, id: &TaskId) -> Option<TaskState> {
        self.tasks.get(id).map(|t| t.clone())
    }

    pub fn get_all_tasks(&self) -> Vec<TaskState> {
        let mut all: Vec<TaskState> = self.tasks.iter().map(|t| t.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Wait until the task reaches a terminal status, bounded by its own
    /// timeout plus a scheduling margin.
    pub async fn await_task(&self, task_id: &TaskId) -> SwarmResult<TaskState> {
        let deadline = {
            let task = self
                .tasks
                .get(task_id)
                .ok_or_else(|| SwarmError::unknown_task(task_id))?;
            if task.status.is_terminal() {
                return Ok(task.clone());
            }
            Duration::from_millis(task.timeout_ms + 1_000)
        };
        let mut rx = self
            .task_waiters
            .get(&task_id.id)
            .map(|w| w.sender.subscribe())
            .ok_or_else(|| SwarmError::unknown_task(task_id))?;

        let result = tokio::time::timeout(deadline, async {
            loop {
                if rx.borrow().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        if result.is_err() {
            warn!(task = %task_id, "await_task hit its deadline");
        }
        self.tasks
            .get(task_id)
            .map(|t| t.clone())
            .ok_or_else(|| SwarmError::unknown_task(task_id))
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Try to place a task on the best idle agent. Returns whether it was
    /// assigned; unassignable tasks are queued.
    pub(crate) async fn try_assign(&self, task_id: &TaskId) -> SwarmResult<bool> {
        let chosen = self.pick_agent(task_id);
        let Some(agent_id) = chosen else {
            self.queue_task(task_id)?;
            return Ok(false);
        };
        self.commit_assignment(task_id, &agent_id).await?;
        Ok(true)
    }

    /// Candidate scoring:
    /// `100 + 50·type_match + 10·success_rate − 20·workload − 5·(avg_ms/60000)`,
    /// multiplied by health; ties break on the lowest instance.
    fn pick_agent(&self, task_id: &TaskId) -> Option<AgentId> {
        let task = self.tasks.get(task_id)?;
        let mut best: Option<(f64, AgentId)> = None;
        for agent in self.agents.iter() {
            if agent.status != AgentStatus::Idle {
                continue;
            }
            let type_match = kind_matches(&task.kind, &agent) as u8 as f64;
            let mut score = 100.0 + 50.0 * type_match + 10.0 * agent.metrics.success_rate
                - 20.0 * agent.workload
                - 5.0 * (agent.metrics.avg_task_duration_ms / 60_000.0);
            score *= agent.health;
            let better = match &best {
                None => true,
                Some((best_score, best_id)) => {
                    score > *best_score
                        || (score == *best_score && agent.id.instance < best_id.instance)
                }
            };
            if better {
                best = Some((score, agent.id.clone()));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Apply the assignment transitions, then send `task_assign` on the bus.
    pub(crate) async fn commit_assignment(
        &self,
        task_id: &TaskId,
        agent_id: &AgentId,
    ) -> SwarmResult<()> {
        let (priority, ttl_ms, payload) = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| SwarmError::unknown_task(task_id))?;
            task.transition(TaskStatus::Assigned)?;
            task.assigned_to = Some(agent_id.clone());
            // Execution time is measured from dispatch; an explicit
            // `Running` report keeps the earlier stamp.
            task.started_at = Some(chrono::Utc::now());
            (
                bus_priority(task.priority),
                task.timeout_ms,
                json!({
                    "task_id": task_id.id,
                    "kind": task.kind,
                    "name": task.name,
                    "description": task.description,
                    "input": task.input,
                    "timeout_ms": task.timeout_ms,
                }),
            )
        };
        {
            let mut agent = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| SwarmError::unknown_agent(agent_id))?;
            agent.status = AgentStatus::Busy;
            agent.current_task = Some(task_id.clone());
            agent.workload = 1.0;
            agent.metrics.last_activity = chrono::Utc::now();
        }
        self.domains.claim_member(agent_id);
        self.push_agent_score(agent_id);
        self.notify_task_status(task_id);

        let message = Message::new(
            MessageKind::TaskAssign,
            self.control_id.clone(),
            Recipient::Agent(agent_id.clone()),
            payload,
        )
        .with_priority(priority)
        .with_ack()
        .with_ttl_ms(ttl_ms);

        if let Err(e) = self.bus.send_with_retry(message, 3).await {
            // Undo the placement so the task can be queued again.
            warn!(task = %task_id, error = %e, "task_assign send failed; requeueing");
            self.reset_agent_to_idle(agent_id);
            self.release_to_domain(agent_id);
            if let Some(mut task) = self.tasks.get_mut(task_id) {
                let _ = task.transition(TaskStatus::Queued);
            }
            self.enqueue_by_affinity(task_id);
            self.notify_task_status(task_id);
            self.emit(EventKind::TaskQueued, json!({"task_id": task_id.id}));
            return Ok(());
        }

        self.emit(
            EventKind::TaskAssigned,
            json!({"task_id": task_id.id, "agent_id": agent_id.id}),
        );
        debug!(task = %task_id, agent = %agent_id, "task assigned");
        Ok(())
    }

    fn queue_task(&self, task_id: &TaskId) -> SwarmResult<()> {
        {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| SwarmError::unknown_task(task_id))?;
            if task.status != TaskStatus::Queued {
                task.transition(TaskStatus::Queued)?;
            }
        }
        self.queue.lock().push_back(task_id.clone());
        self.notify_task_status(task_id);
        self.emit(EventKind::TaskQueued, json!({"task_id": task_id.id}));
        Ok(())
    }

    /// Dispatch queued tasks for as long as agents keep being found.
    pub(crate) async fn try_dispatch_queue(&self) {
        loop {
            let Some(task_id) = self.queue.lock().pop_front() else {
                break;
            };
            let queued = self
                .tasks
                .get(&task_id)
                .map(|t| t.status == TaskStatus::Queued)
                .unwrap_or(false);
            if !queued {
                continue;
            }
            match self.pick_agent(&task_id) {
                Some(agent_id) => {
                    if let Err(e) = self.commit_assignment(&task_id, &agent_id).await {
                        warn!(task = %task_id, error = %e, "queued dispatch failed");
                    }
                }
                None => {
                    // Nobody is free; put it back and stop scanning.
                    self.queue.lock().push_front(task_id);
                    break;
                }
            }
        }
        self.pump_domain_queues().await;
    }

    // ------------------------------------------------------------------
    // Bus ingestion
    // ------------------------------------------------------------------

    pub(crate) async fn handle_message(&self, message: Message) {
        if let Some(agent_id) = self.agent_index.get(&message.from.id).map(|a| a.clone()) {
            if let Some(mut agent) = self.agents.get_mut(&agent_id) {
                agent.metrics.messages_sent += 1;
            }
        }
        match message.kind {
            MessageKind::TaskComplete => self.on_task_complete(&message).await,
            MessageKind::TaskFail => self.on_task_fail(&message).await,
            MessageKind::Heartbeat => self.on_heartbeat(&message),
            MessageKind::ConsensusVote => self.on_consensus_vote(&message),
            MessageKind::StatusUpdate => self.on_status_update(&message),
            ref other => {
                debug!(kind = %other, from = %message.from, "unhandled control message");
            }
        }
    }

    /// An agent reporting that it actually started working on its task.
    fn on_status_update(&self, message: &Message) {
        if message.payload.get("status").and_then(|s| s.as_str()) != Some("running") {
            return;
        }
        let Some(task_id) = self.task_from_payload(&message.payload) else {
            return;
        };
        let started = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            task.status == TaskStatus::Assigned && task.transition(TaskStatus::Running).is_ok()
        };
        if started {
            self.notify_task_status(&task_id);
            self.emit(
                EventKind::TaskStarted,
                json!({"task_id": task_id.id, "agent_id": message.from.id}),
            );
        }
    }

    async fn on_task_complete(&self, message: &Message) {
        let Some(task_id) = self.task_from_payload(&message.payload) else {
            return;
        };
        let output = message.payload.get("output").cloned();
        let duration_ms = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if task.status.is_terminal() {
                debug!(task = %task_id, "late completion ignored");
                return;
            }
            if task.status == TaskStatus::Assigned {
                let _ = task.transition(TaskStatus::Running);
            }
            if task.transition(TaskStatus::Completed).is_err() {
                return;
            }
            task.output = output;
            task.duration_ms().unwrap_or(0)
        };

        self.metrics.record_task_completed(duration_ms);
        if let Some(agent_id) = self.agent_index.get(&message.from.id).map(|a| a.clone()) {
            if let Some(mut agent) = self.agents.get_mut(&agent_id) {
                agent.status = AgentStatus::Idle;
                agent.current_task = None;
                agent.workload = 0.0;
                agent.metrics.record_success(duration_ms);
                agent.restore_health(0.05);
            }
            self.push_agent_score(&agent_id);
            self.release_to_domain(&agent_id);
        }
        self.notify_task_status(&task_id);
        self.emit(
            EventKind::TaskCompleted,
            json!({"task_id": task_id.id, "agent_id": message.from.id, "duration_ms": duration_ms}),
        );
        self.try_dispatch_queue().await;
    }

    async fn on_task_fail(&self, message: &Message) {
        let Some(task_id) = self.task_from_payload(&message.payload) else {
            return;
        };
        let error = message
            .payload
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("unknown")
            .to_string();

        enum Next {
            Retry,
            Failed,
        }
        let next = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if task.status.is_terminal() {
                return;
            }
            if task.can_retry() {
                task.retries += 1;
                if task.transition(TaskStatus::Queued).is_err() {
                    return;
                }
                Next::Retry
            } else {
                task.error = Some(error.clone());
                if task.transition(TaskStatus::Failed).is_err() {
                    return;
                }
                Next::Failed
            }
        };

        if let Some(agent_id) = self.agent_index.get(&message.from.id).map(|a| a.clone()) {
            if let Some(mut agent) = self.agents.get_mut(&agent_id) {
                agent.status = AgentStatus::Idle;
                agent.current_task = None;
                agent.workload = 0.0;
                agent.metrics.record_failure();
            }
            self.push_agent_score(&agent_id);
            self.release_to_domain(&agent_id);
        }

        match next {
            Next::Retry => {
                debug!(task = %task_id, %error, "task failed; retrying");
                self.enqueue_by_affinity(&task_id);
                self.notify_task_status(&task_id);
                self.emit(EventKind::TaskQueued, json!({"task_id": task_id.id, "retry": true}));
                self.try_dispatch_queue().await;
            }
            Next::Failed => {
                warn!(task = %task_id, %error, "task failed terminally");
                self.metrics.record_task_failed();
                self.notify_task_status(&task_id);
                self.emit(
                    EventKind::TaskFailed,
                    json!({"task_id": task_id.id, "error": error}),
                );
                self.try_dispatch_queue().await;
            }
        }
    }

    fn on_heartbeat(&self, message: &Message) {
        let Some(agent_id) = self.agent_index.get(&message.from.id).map(|a| a.clone()) else {
            return;
        };
        if let Some(mut agent) = self.agents.get_mut(&agent_id) {
            agent.heartbeat();
            if agent.status == AgentStatus::Error {
                agent.status = if agent.current_task.is_some() {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Idle
                };
            }
        }
        self.push_agent_score(&agent_id);
        self.emit(EventKind::AgentHeartbeat, json!({"agent_id": agent_id.id}));
    }

    fn on_consensus_vote(&self, message: &Message) {
        let Some(proposal_id) = message
            .payload
            .get("proposal_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            return;
        };
        let approve = message
            .payload
            .get("approve")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let confidence = message
            .payload
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        let vote = if approve {
            waggle_consensus::Vote::approve(message.from.clone()).with_confidence(confidence)
        } else {
            waggle_consensus::Vote::reject(message.from.clone(), "voted no")
                .with_confidence(confidence)
        };
        if let Err(e) = self.engine.vote(proposal_id, vote) {
            debug!(proposal = %proposal_id, error = %e, "vote not applied");
        }
    }

    // ------------------------------------------------------------------
    // Consensus
    // ------------------------------------------------------------------

    /// Open a proposal, broadcast it to the swarm and wait for resolution.
    /// A timeout resolves as a rejected outcome, not an error.
    pub async fn propose_consensus(&self, value: serde_json::Value) -> SwarmResult<ConsensusOutcome> {
        let started = Instant::now();
        let proposal = self.engine.propose(value.clone(), self.control_id.clone())?;
        let announce = Message::new(
            MessageKind::ConsensusProposal,
            self.control_id.clone(),
            Recipient::Broadcast,
            json!({
                "proposal_id": proposal.id,
                "term": proposal.term,
                "value": value,
            }),
        )
        .with_priority(MessagePriority::High);
        let _ = self.bus.broadcast(announce);

        let outcome = self.engine.await_consensus(proposal.id).await?;
        let result = Message::new(
            MessageKind::ConsensusResult,
            self.control_id.clone(),
            Recipient::Broadcast,
            json!({
                "proposal_id": outcome.proposal_id,
                "approved": outcome.approved,
                "final_value": outcome.final_value,
            }),
        );
        let _ = self.bus.broadcast(result);
        self.metrics.record_coordination_latency(started.elapsed());
        Ok(outcome)
    }

    /// Best-effort broadcast to every subscribed agent; never fails.
    pub fn broadcast_message(
        &self,
        payload: serde_json::Value,
        priority: MessagePriority,
    ) -> usize {
        let message = Message::new(
            MessageKind::Broadcast,
            self.control_id.clone(),
            Recipient::Broadcast,
            payload,
        )
        .with_priority(priority);
        self.bus.broadcast(message).unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Degrade agents that missed three heartbeat intervals; with auto
    /// recovery, collapse triggers task re-queue and an idle reset.
    async fn check_heartbeats(&self) {
        let stale_after_ms = 3 * self.config.heartbeat_interval_ms;
        let now = chrono::Utc::now();
        let mut recovered_tasks = Vec::new();
        let mut degraded = Vec::new();

        for mut agent in self.agents.iter_mut() {
            let age_ms = (now - agent.last_heartbeat).num_milliseconds().max(0) as u64;
            if age_ms <= stale_after_ms {
                continue;
            }
            agent.degrade_health(0.2);
            if agent.status != AgentStatus::Error {
                agent.status = AgentStatus::Error;
                self.emit(
                    EventKind::AgentStatusChanged,
                    json!({"agent_id": agent.id.id, "status": agent.status, "health": agent.health}),
                );
            }
            if self.config.auto_recovery && agent.health <= 0.2 {
                if let Some(task_id) = agent.current_task.take() {
                    recovered_tasks.push(task_id);
                }
                agent.status = AgentStatus::Idle;
                agent.workload = 0.0;
            }
            degraded.push(agent.id.clone());
        }
        for agent_id in degraded {
            self.push_agent_score(&agent_id);
        }

        for task_id in recovered_tasks {
            let requeued = {
                let Some(mut task) = self.tasks.get_mut(&task_id) else {
                    continue;
                };
                !task.status.is_terminal() && task.transition(TaskStatus::Queued).is_ok()
            };
            if requeued {
                warn!(task = %task_id, "re-queueing task from unhealthy agent");
                self.enqueue_by_affinity(&task_id);
                self.notify_task_status(&task_id);
                self.emit(EventKind::TaskQueued, json!({"task_id": task_id.id, "recovered": true}));
            }
        }
        self.try_dispatch_queue().await;
    }

    /// Time out tasks that outlived their deadline.
    async fn check_task_deadlines(&self) {
        let now = chrono::Utc::now();
        let mut expired = Vec::new();
        for task in self.tasks.iter() {
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                continue;
            }
            let start = task.started_at.unwrap_or(task.created_at);
            let elapsed_ms = (now - start).num_milliseconds().max(0) as u64;
            if elapsed_ms > task.timeout_ms {
                expired.push((task.id.clone(), task.assigned_to.clone()));
            }
        }
        for (task_id, assignee) in expired {
            let timed_out = {
                let Some(mut task) = self.tasks.get_mut(&task_id) else {
                    continue;
                };
                task.transition(TaskStatus::Timeout).is_ok()
            };
            if !timed_out {
                continue;
            }
            warn!(task = %task_id, "task timed out");
            self.metrics.record_task_failed();
            if let Some(agent_id) = assignee {
                self.reset_agent_to_idle(&agent_id);
                self.release_to_domain(&agent_id);
            }
            self.notify_task_status(&task_id);
            self.emit(
                EventKind::TaskFailed,
                json!({"task_id": task_id.id, "reason": "timeout"}),
            );
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn get_state(&self) -> SwarmStateSnapshot {
        let (mut idle, mut busy) = (0usize, 0usize);
        for agent in self.agents.iter() {
            match agent.status {
                AgentStatus::Idle => idle += 1,
                AgentStatus::Busy => busy += 1,
                _ => {}
            }
        }
        let (mut queued, mut running) = (0usize, 0usize);
        for task in self.tasks.iter() {
            match task.status {
                TaskStatus::Queued | TaskStatus::Created => queued += 1,
                TaskStatus::Assigned | TaskStatus::Running => running += 1,
                _ => {}
            }
        }
        SwarmStateSnapshot {
            swarm_id: self.swarm_id.clone(),
            status: self.get_status(),
            agents: self.agents.len(),
            idle_agents: idle,
            busy_agents: busy,
            queued_tasks: queued,
            running_tasks: running,
            topology: self.topology.get_state(),
        }
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        self.metrics.snapshot(
            self.active_agent_count(),
            self.bus.stats().messages_per_second,
            self.engine.stats().success_rate,
        )
    }

    pub fn get_performance_report(&self) -> PerformanceReport {
        self.metrics.report(
            self.active_agent_count(),
            self.bus.stats().messages_per_second,
            self.engine.stats().success_rate,
        )
    }

    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    pub fn consensus_stats(&self) -> ConsensusStats {
        self.engine.stats()
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(crate) fn emit(&self, kind: EventKind, data: serde_json::Value) {
        self.events
            .emit(SwarmEvent::new(kind, "coordinator", data));
    }

    pub(crate) fn reset_agent_to_idle(&self, agent_id: &AgentId) {
        if let Some(mut agent) = self.agents.get_mut(agent_id) {
            if agent.status.is_terminated() {
                return;
            }
            agent.status = AgentStatus::Idle;
            agent.current_task = None;
            agent.workload = 0.0;
        }
        self.push_agent_score(agent_id);
    }

    /// Mirror the agent's live health, workload and availability into its
    /// topology node, so election and rebalancing see current state. A busy
    /// node is protected from partition moves until its agent drains.
    fn push_agent_score(&self, agent_id: &AgentId) {
        let Some(agent) = self.agents.get(agent_id) else {
            return;
        };
        let node_status = match agent.status {
            AgentStatus::Busy => NodeStatus::Busy,
            AgentStatus::Terminating => NodeStatus::Draining,
            AgentStatus::Error | AgentStatus::Offline | AgentStatus::Terminated => {
                NodeStatus::Offline
            }
            _ => NodeStatus::Active,
        };
        self.topology.update_node(
            agent_id,
            NodePatch {
                status: Some(node_status),
                score: Some(NodeScore {
                    health: agent.health,
                    reliability: agent.capabilities.reliability,
                    workload: agent.workload,
                }),
                ..NodePatch::default()
            },
        );
    }

    /// Domain tagged at submission, if any.
    pub(crate) fn task_domain(&self, task_id: &TaskId) -> Option<Domain> {
        self.tasks.get(task_id).and_then(|t| {
            t.metadata
                .get("domain")
                .and_then(|v| v.as_str())
                .and_then(Domain::from_str)
        })
    }

    /// Push a re-queued task onto its domain queue when it has one, the
    /// global queue otherwise.
    fn enqueue_by_affinity(&self, task_id: &TaskId) {
        match self.task_domain(task_id) {
            Some(domain) => self.domains.queue_push(domain, task_id.clone()),
            None => self.queue.lock().push_back(task_id.clone()),
        }
    }

    fn notify_task_status(&self, task_id: &TaskId) {
        let Some(status) = self.tasks.get(task_id).map(|t| t.status) else {
            return;
        };
        if let Some(waiter) = self.task_waiters.get(&task_id.id) {
            let _ = waiter.sender.send(status);
        }
    }

    fn task_from_payload(&self, payload: &serde_json::Value) -> Option<TaskId> {
        let uuid = payload
            .get("task_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())?;
        self.task_index.get(&uuid).map(|t| t.clone())
    }
}

/// Map task priority onto a bus lane.
pub(crate) fn bus_priority(priority: waggle_core::TaskPriority) -> MessagePriority {
    use waggle_core::TaskPriority::*;
    match priority {
        Critical => MessagePriority::Urgent,
        High => MessagePriority::High,
        Normal => MessagePriority::Normal,
        Low | Background => MessagePriority::Low,
    }
}

/// Whether an agent's declared capabilities cover a task kind.
fn kind_matches(kind: &waggle_core::TaskKind, agent: &AgentState) -> bool {
    use waggle_core::TaskKind::*;
    let caps = &agent.capabilities;
    match kind {
        Coding => caps.code,
        Testing => caps.test,
        Review => caps.review,
        Documentation => caps.documentation,
        Research => caps.research,
        Analysis => caps.analysis,
        Coordination | Consensus => caps.coordination,
        Custom(_) => false,
    }
}
