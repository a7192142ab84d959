//! Coordinator metrics: smoothed averages, latency window, report

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Exponentially-weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: f64,
    primed: bool,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: 0.0,
            primed: false,
        }
    }

    pub fn update(&mut self, sample: f64) {
        if self.primed {
            self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        } else {
            self.value = sample;
            self.primed = true;
        }
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// Ring buffer of recent coordination-operation latencies.
pub struct LatencyWindow {
    samples: VecDeque<(Instant, f64)>,
    capacity: usize,
}

impl LatencyWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((Instant::now(), latency_ms));
    }

    /// Mean of the most recent `n` samples.
    pub fn mean_recent(&self, n: usize) -> f64 {
        let taken: Vec<f64> = self
            .samples
            .iter()
            .rev()
            .take(n)
            .map(|(_, v)| *v)
            .collect();
        if taken.is_empty() {
            0.0
        } else {
            taken.iter().sum::<f64>() / taken.len() as f64
        }
    }

    /// Percentile over samples recorded inside `window`.
    pub fn percentile(&self, p: f64, window: Duration) -> f64 {
        let cutoff = Instant::now().checked_sub(window);
        let mut recent: Vec<f64> = self
            .samples
            .iter()
            .filter(|(at, _)| cutoff.map_or(true, |c| *at >= c))
            .map(|(_, v)| *v)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        recent.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((recent.len() - 1) as f64 * p).round() as usize;
        recent[index.min(recent.len() - 1)]
    }
}

/// Snapshot of coordinator-level metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub uptime_ms: u64,
    pub active_agents: usize,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_task_duration_ms: f64,
    pub messages_per_second: f64,
    pub consensus_success_rate: f64,
    /// Mean latency of the last 50 coordination operations.
    pub coordination_latency_ms: f64,
}

/// Metrics snapshot plus tail latencies over the last minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub metrics: CoordinatorMetrics,
    pub p50_coordination_latency_ms: f64,
    pub p99_coordination_latency_ms: f64,
    pub window_secs: u64,
}

const LATENCY_RING_CAPACITY: usize = 1_000;
const REPORT_WINDOW: Duration = Duration::from_secs(60);
const TASK_DURATION_ALPHA: f64 = 0.1;

/// Internal metrics registry owned by the coordinator.
pub(crate) struct MetricsRegistry {
    started_at: Instant,
    total_tasks: AtomicU64,
    completed_tasks: AtomicU64,
    failed_tasks: AtomicU64,
    avg_task_duration: Mutex<Ewma>,
    latency: Mutex<LatencyWindow>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_tasks: AtomicU64::new(0),
            completed_tasks: AtomicU64::new(0),
            failed_tasks: AtomicU64::new(0),
            avg_task_duration: Mutex::new(Ewma::new(TASK_DURATION_ALPHA)),
            latency: Mutex::new(LatencyWindow::new(LATENCY_RING_CAPACITY)),
        }
    }

    pub fn record_task_created(&self) {
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("waggle_tasks_total").increment(1);
    }

    pub fn record_task_completed(&self, duration_ms: u64) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
        self.avg_task_duration.lock().update(duration_ms as f64);
        metrics::counter!("waggle_tasks_completed_total").increment(1);
        metrics::histogram!("waggle_task_duration_ms").record(duration_ms as f64);
    }

    pub fn record_task_failed(&self) {
        self.failed_tasks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("waggle_tasks_failed_total").increment(1);
    }

    pub fn record_coordination_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.latency.lock().record(ms);
        metrics::histogram!("waggle_coordination_latency_ms").record(ms);
    }

    pub fn snapshot(
        &self,
        active_agents: usize,
        messages_per_second: f64,
        consensus_success_rate: f64,
    ) -> CoordinatorMetrics {
        CoordinatorMetrics {
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            active_agents,
            total_tasks: self.total_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            avg_task_duration_ms: self.avg_task_duration.lock().get(),
            messages_per_second,
            consensus_success_rate,
            coordination_latency_ms: self.latency.lock().mean_recent(50),
        }
    }

    pub fn report(
        &self,
        active_agents: usize,
        messages_per_second: f64,
        consensus_success_rate: f64,
    ) -> PerformanceReport {
        let latency = self.latency.lock();
        PerformanceReport {
            metrics: self.snapshot(active_agents, messages_per_second, consensus_success_rate),
            p50_coordination_latency_ms: latency.percentile(0.50, REPORT_WINDOW),
            p99_coordination_latency_ms: latency.percentile(0.99, REPORT_WINDOW),
            window_secs: REPORT_WINDOW.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_towards_samples() {
        let mut ewma = Ewma::new(0.1);
        ewma.update(100.0);
        assert_eq!(ewma.get(), 100.0);
        ewma.update(200.0);
        assert!((ewma.get() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn latency_window_caps_its_capacity() {
        let mut window = LatencyWindow::new(10);
        for i in 0..25 {
            window.record(i as f64);
        }
        // Only the last 10 samples remain.
        assert!((window.mean_recent(100) - 19.5).abs() < 1e-9);
    }

    #[test]
    fn percentiles_are_ordered() {
        let mut window = LatencyWindow::new(1_000);
        for i in 1..=100 {
            window.record(i as f64);
        }
        let p50 = window.percentile(0.50, Duration::from_secs(60));
        let p99 = window.percentile(0.99, Duration::from_secs(60));
        assert!(p50 < p99);
        assert!(p99 <= 100.0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let registry = MetricsRegistry::new();
        registry.record_task_created();
        registry.record_task_completed(500);
        registry.record_task_created();
        registry.record_task_failed();
        let snapshot = registry.snapshot(3, 10.0, 0.9);
        assert_eq!(snapshot.total_tasks, 2);
        assert_eq!(snapshot.completed_tasks, 1);
        assert_eq!(snapshot.failed_tasks, 1);
        assert!(snapshot.avg_task_duration_ms > 0.0);
        assert_eq!(snapshot.active_agents, 3);
    }
}
