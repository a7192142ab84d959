//! Agent pool: availability tracking, auto-scaling, health replacement
//!
//! A pool tracks which of its member agents are available and which are
//! busy; the agent states themselves stay in the coordinator's maps. The
//! pool drives lifecycle through a [`PoolBackend`], which is how it creates
//! replacements and retires unhealthy members without owning the state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::Notify, time::interval};
use tracing::{debug, info, warn};
use waggle_core::{
    AgentId, AgentKind, AgentStatus, EventBus, EventKind, SwarmError, SwarmEvent, SwarmResult,
};

/// Configuration of one agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Utilisation at or above which the pool grows by one.
    pub scale_up_threshold: f64,
    /// Utilisation at or below which the pool shrinks by one.
    pub scale_down_threshold: f64,
    /// Minimum spacing between two scale operations.
    pub cooldown_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_ms: 10_000,
            health_check_interval_ms: waggle_core::DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_size == 0 || self.min_size > self.max_size {
            return Err(SwarmError::Configuration(format!(
                "pool size bounds invalid: min {} max {}",
                self.min_size, self.max_size
            )));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(SwarmError::Configuration(
                "pool.scaleDownThreshold must be below scaleUpThreshold".into(),
            ));
        }
        Ok(())
    }

    /// A fixed-size pool: no growth, no shrink below the member count.
    pub fn fixed(size: usize) -> Self {
        Self {
            min_size: size,
            max_size: size,
            ..Self::default()
        }
    }
}

/// Lifecycle seam between a pool and the component that owns agent state.
pub trait PoolBackend: Send + Sync {
    /// Create and register a fresh agent for this pool.
    fn create_agent(&self, kind: AgentKind, name: &str) -> SwarmResult<AgentId>;

    /// Retire an agent permanently.
    fn retire_agent(&self, id: &AgentId);

    /// Milliseconds since the agent's last heartbeat, `None` if unknown.
    fn heartbeat_age_ms(&self, id: &AgentId) -> Option<u64>;

    /// Degrade the agent's health, returning the new value.
    fn degrade_agent(&self, id: &AgentId, amount: f64) -> f64;

    /// Record a status change driven by the pool.
    fn mark_agent_status(&self, id: &AgentId, status: AgentStatus);
}

/// Observable pool state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    pub name: String,
    pub size: usize,
    pub available: Vec<AgentId>,
    pub busy: Vec<AgentId>,
    pub utilization: f64,
}

struct PoolInner {
    /// Front is the least recently used member.
    available: VecDeque<AgentId>,
    busy: HashSet<AgentId>,
    last_scale: Option<Instant>,
}

/// A pool of agents of one kind.
pub struct AgentPool {
    name: String,
    kind: AgentKind,
    config: PoolConfig,
    backend: Arc<dyn PoolBackend>,
    inner: Mutex<PoolInner>,
    events: Arc<EventBus>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl AgentPool {
    pub fn new(
        name: impl Into<String>,
        kind: AgentKind,
        config: PoolConfig,
        backend: Arc<dyn PoolBackend>,
        events: Arc<EventBus>,
    ) -> SwarmResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            kind,
            config,
            backend,
            inner: Mutex::new(PoolInner {
                available: VecDeque::new(),
                busy: HashSet::new(),
                last_scale: None,
            }),
            events,
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take an available agent, growing the pool when below `max_size`.
    /// Returns `None` (and emits `pool.exhausted`) when saturated.
    pub fn acquire(&self) -> Option<AgentId> {
        let acquired = {
            let mut inner = self.inner.lock();
            match inner.available.pop_front() {
                Some(id) => {
                    inner.busy.insert(id.clone());
                    Some(id)
                }
                None => {
                    let size = inner.busy.len();
                    if size < self.config.max_size {
                        match self.backend.create_agent(self.kind, &self.name) {
                            Ok(id) => {
                                inner.busy.insert(id.clone());
                                inner.last_scale = Some(Instant::now());
                                Some(id)
                            }
                            Err(e) => {
                                warn!(pool = %self.name, error = %e, "pool growth failed");
                                None
                            }
                        }
                    } else {
                        None
                    }
                }
            }
        };
        match &acquired {
            Some(id) => debug!(pool = %self.name, agent = %id, "agent acquired"),
            None => {
                self.events.emit(SwarmEvent::new(
                    EventKind::PoolExhausted,
                    "pool",
                    serde_json::json!({"pool": self.name}),
                ));
            }
        }
        self.auto_scale();
        acquired
    }

    /// Return an agent to the available set. Releasing an agent that is not
    /// busy is a no-op.
    pub fn release(&self, id: &AgentId) {
        {
            let mut inner = self.inner.lock();
            if !inner.busy.remove(id) {
                return;
            }
            inner.available.push_back(id.clone());
        }
        debug!(pool = %self.name, agent = %id, "agent released");
        self.auto_scale();
    }

    /// Targeted acquire: move a specific member from available to busy.
    /// Returns `false` when the agent is not currently available.
    pub fn claim(&self, id: &AgentId) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.available.iter().position(|a| a == id) {
            inner.available.remove(pos);
            inner.busy.insert(id.clone());
            true
        } else {
            false
        }
    }

    /// Add an externally created agent as available.
    pub fn add(&self, id: AgentId) {
        let mut inner = self.inner.lock();
        if inner.busy.contains(&id) || inner.available.contains(&id) {
            return;
        }
        inner.available.push_back(id);
    }

    /// Forget every member without retiring them; used when the owning
    /// coordinator clears its own agent map.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.available.clear();
        inner.busy.clear();
    }

    /// Remove an agent from the pool. Unknown ids are a no-op. Returns
    /// whether the agent was a member.
    pub fn remove(&self, id: &AgentId) -> bool {
        let mut inner = self.inner.lock();
        let was_busy = inner.busy.remove(id);
        let was_available = if let Some(pos) = inner.available.iter().position(|a| a == id) {
            inner.available.remove(pos);
            true
        } else {
            false
        };
        was_busy || was_available
    }

    /// Grow or shrink by `delta`, clamped to the configured bounds.
    /// Returns the applied change.
    pub fn scale(&self, delta: i64) -> i64 {
        if delta > 0 {
            let mut grown = 0;
            for _ in 0..delta {
                let size = self.size();
                if size >= self.config.max_size {
                    break;
                }
                match self.backend.create_agent(self.kind, &self.name) {
                    Ok(id) => {
                        self.inner.lock().available.push_back(id);
                        grown += 1;
                    }
                    Err(_) => break,
                }
            }
            if grown > 0 {
                self.inner.lock().last_scale = Some(Instant::now());
            }
            grown
        } else {
            let mut shrunk = 0;
            for _ in 0..delta.unsigned_abs() {
                let victim = {
                    let mut inner = self.inner.lock();
                    let size = inner.available.len() + inner.busy.len();
                    if size <= self.config.min_size {
                        break;
                    }
                    inner.available.pop_front()
                };
                let Some(victim) = victim else { break };
                self.backend.retire_agent(&victim);
                shrunk += 1;
            }
            if shrunk > 0 {
                self.inner.lock().last_scale = Some(Instant::now());
            }
            -shrunk
        }
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.available.len() + inner.busy.len()
    }

    pub fn utilization(&self) -> f64 {
        let inner = self.inner.lock();
        let size = inner.available.len() + inner.busy.len();
        if size == 0 {
            0.0
        } else {
            inner.busy.len() as f64 / size as f64
        }
    }

    pub fn get_state(&self) -> PoolState {
        let inner = self.inner.lock();
        let size = inner.available.len() + inner.busy.len();
        PoolState {
            name: self.name.clone(),
            size,
            available: inner.available.iter().cloned().collect(),
            busy: inner.busy.iter().cloned().collect(),
            utilization: if size == 0 {
                0.0
            } else {
                inner.busy.len() as f64 / size as f64
            },
        }
    }

    /// Start the periodic health check.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(
                pool.config.health_check_interval_ms.max(1),
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !pool.running.load(Ordering::SeqCst) {
                            break;
                        }
                        pool.health_check();
                    }
                    _ = pool.shutdown.notified() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
        }
    }

    /// One health pass: agents silent for three intervals lose 0.2 health
    /// and are marked errored; agents at zero health are replaced.
    pub fn health_check(&self) {
        let stale_after = 3 * self.config.health_check_interval_ms;
        let members: Vec<(AgentId, bool)> = {
            let inner = self.inner.lock();
            inner
                .available
                .iter()
                .map(|id| (id.clone(), false))
                .chain(inner.busy.iter().map(|id| (id.clone(), true)))
                .collect()
        };

        for (id, was_busy) in members {
            let Some(age_ms) = self.backend.heartbeat_age_ms(&id) else {
                continue;
            };
            if age_ms <= stale_after {
                continue;
            }
            let health = self.backend.degrade_agent(&id, 0.2);
            self.backend.mark_agent_status(&id, AgentStatus::Error);
            debug!(pool = %self.name, agent = %id, health, "missed heartbeats");
            if health > 0.0 {
                continue;
            }

            self.remove(&id);
            self.backend.retire_agent(&id);
            info!(pool = %self.name, agent = %id, "unhealthy agent removed");
            if self.size() < self.config.min_size || was_busy {
                if let Ok(replacement) = self.backend.create_agent(self.kind, &self.name) {
                    self.inner.lock().available.push_back(replacement);
                }
            }
        }
    }

    /// Utilisation-driven scaling, rate-limited by the cooldown.
    fn auto_scale(&self) {
        let (utilization, size, cooled_down) = {
            let inner = self.inner.lock();
            let size = inner.available.len() + inner.busy.len();
            let utilization = if size == 0 {
                0.0
            } else {
                inner.busy.len() as f64 / size as f64
            };
            let cooled_down = inner
                .last_scale
                .map(|t| t.elapsed() >= Duration::from_millis(self.config.cooldown_ms))
                .unwrap_or(true);
            (utilization, size, cooled_down)
        };
        if !cooled_down {
            return;
        }
        if utilization >= self.config.scale_up_threshold && size < self.config.max_size {
            if self.scale(1) > 0 {
                info!(pool = %self.name, size = size + 1, "pool scaled up");
            }
        } else if utilization <= self.config.scale_down_threshold && size > self.config.min_size {
            if self.scale(-1) < 0 {
                info!(pool = %self.name, size = size - 1, "pool scaled down");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashmap::DashMap;
    use uuid::Uuid;
    use waggle_core::IdAllocator;

    /// Backend that fabricates agents and records retirements.
    struct MockBackend {
        allocator: IdAllocator,
        heartbeat_ages: DashMap<AgentId, u64>,
        healths: DashMap<AgentId, f64>,
        retired: Mutex<Vec<AgentId>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                allocator: IdAllocator::new(Uuid::new_v4()),
                heartbeat_ages: DashMap::new(),
                healths: DashMap::new(),
                retired: Mutex::new(Vec::new()),
            }
        }
    }

    impl PoolBackend for MockBackend {
        fn create_agent(&self, kind: AgentKind, _name: &str) -> SwarmResult<AgentId> {
            let id = self.allocator.agent_id(kind);
            self.heartbeat_ages.insert(id.clone(), 0);
            self.healths.insert(id.clone(), 1.0);
            Ok(id)
        }

        fn retire_agent(&self, id: &AgentId) {
            self.retired.lock().push(id.clone());
        }

        fn heartbeat_age_ms(&self, id: &AgentId) -> Option<u64> {
            self.heartbeat_ages.get(id).map(|v| *v)
        }

        fn degrade_agent(&self, id: &AgentId, amount: f64) -> f64 {
            let mut health = self.healths.entry(id.clone()).or_insert(1.0);
            *health = (*health - amount).max(0.0);
            *health
        }

        fn mark_agent_status(&self, _id: &AgentId, _status: AgentStatus) {}
    }

    fn pool(config: PoolConfig) -> (Arc<AgentPool>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(
            AgentPool::new(
                "workers",
                AgentKind::Worker,
                config,
                backend.clone(),
                Arc::new(EventBus::new()),
            )
            .unwrap(),
        );
        (pool, backend)
    }

    #[tokio::test]
    async fn acquire_grows_up_to_max_then_exhausts() {
        let (pool, _) = pool(PoolConfig {
            min_size: 0,
            max_size: 2,
            cooldown_ms: 60_000,
            ..PoolConfig::default()
        });
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.utilization(), 1.0);
    }

    #[tokio::test]
    async fn release_returns_agent_and_double_release_is_noop() {
        let (pool, _) = pool(PoolConfig {
            min_size: 0,
            max_size: 2,
            cooldown_ms: 60_000,
            ..PoolConfig::default()
        });
        let id = pool.acquire().unwrap();
        pool.release(&id);
        pool.release(&id);
        let state = pool.get_state();
        assert_eq!(state.available.len(), 1);
        assert!(state.busy.is_empty());
    }

    #[tokio::test]
    async fn available_and_busy_stay_disjoint() {
        let (pool, _) = pool(PoolConfig {
            min_size: 0,
            max_size: 4,
            cooldown_ms: 60_000,
            ..PoolConfig::default()
        });
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(&a);
        let state = pool.get_state();
        let overlap = state.available.iter().any(|id| state.busy.contains(id));
        assert!(!overlap);
        assert_eq!(state.size, 2);
        drop(b);
    }

    #[tokio::test]
    async fn scale_is_clamped_to_bounds() {
        let (pool, _) = pool(PoolConfig {
            min_size: 1,
            max_size: 3,
            cooldown_ms: 0,
            ..PoolConfig::default()
        });
        assert_eq!(pool.scale(10), 3);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.scale(-10), -2);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn unhealthy_agent_is_replaced() {
        let (pool, backend) = pool(PoolConfig {
            min_size: 1,
            max_size: 3,
            cooldown_ms: 60_000,
            health_check_interval_ms: 100,
            ..PoolConfig::default()
        });
        assert_eq!(pool.scale(1), 1);
        let id = pool.get_state().available[0].clone();
        backend.heartbeat_ages.insert(id.clone(), 10_000);
        backend.healths.insert(id.clone(), 0.2);

        // First pass degrades to zero and replaces.
        pool.health_check();
        assert!(backend.retired.lock().contains(&id));
        assert_eq!(pool.size(), 1);
        assert!(!pool.get_state().available.contains(&id));
    }

    #[tokio::test]
    async fn scale_down_prefers_least_recently_used() {
        let (pool, backend) = pool(PoolConfig {
            min_size: 0,
            max_size: 4,
            cooldown_ms: 0,
            ..PoolConfig::default()
        });
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(&a);
        pool.release(&b);
        // `a` was released first, so it is the LRU victim.
        pool.scale(-1);
        assert_eq!(backend.retired.lock().first(), Some(&a));
        drop(b);
    }
}
