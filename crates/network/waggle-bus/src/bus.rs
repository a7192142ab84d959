//! The message bus: priority lanes, dispatch loop, ack/retry tracking

use crate::message::{Ack, Message, MessageKind, MessagePriority, Recipient};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{sync::Notify, time::interval};
use tracing::{debug, trace, warn};
use uuid::Uuid;
use waggle_core::{AgentId, EventBus, EventKind, SwarmError, SwarmEvent, SwarmResult};

/// Configuration of the message bus.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusConfig {
    /// Total queued messages across all lanes before `send` fails.
    pub max_queue_size: usize,
    /// Dispatch loop period in milliseconds.
    pub processing_interval_ms: u64,
    /// How long to wait for an ack before redelivering.
    pub ack_timeout_ms: u64,
    /// Redeliveries before a message is dropped with an error event.
    pub retry_attempts: u32,
    pub enable_persistence: bool,
    pub compression_enabled: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            processing_interval_ms: 10,
            ack_timeout_ms: 5_000,
            retry_attempts: 3,
            enable_persistence: false,
            compression_enabled: false,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> SwarmResult<()> {
        if self.max_queue_size == 0 {
            return Err(SwarmError::Configuration(
                "messageBus.maxQueueSize must be positive".into(),
            ));
        }
        if self.processing_interval_ms == 0 {
            return Err(SwarmError::Configuration(
                "messageBus.processingIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Receiver side of a subscription. Exactly one handler exists per agent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> SwarmResult<()>;
}

/// A channel sender works directly as a handler; convenient for agents that
/// drain their own mailbox.
#[async_trait]
impl MessageHandler for tokio::sync::mpsc::UnboundedSender<Message> {
    async fn handle(&self, message: Message) -> SwarmResult<()> {
        self.send(message)
            .map_err(|e| SwarmError::HandlerFailure(e.to_string()))
    }
}

/// Snapshot of bus throughput and delivery quality.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusStats {
    /// EWMA-smoothed delivered messages per second.
    pub messages_per_second: f64,
    /// EWMA-smoothed enqueue-to-handler latency in milliseconds.
    pub avg_delivery_latency_ms: f64,
    pub queue_depth: usize,
    /// Acked / (acked + retry-exhausted); 1.0 before any ack was required.
    pub ack_rate: f64,
    /// Errors (TTL drops, handler failures, exhausted retries) / sent.
    pub error_rate: f64,
}

struct QueuedMessage {
    message: Message,
    enqueued_at: Instant,
    /// Deliveries already attempted; 0 for a fresh message.
    attempt: u32,
}

struct PendingAck {
    message: Message,
    attempts: u32,
    deadline: Instant,
}

struct SmoothedStats {
    throughput: f64,
    latency_ms: f64,
    delivered_since_tick: u64,
    last_tick: Instant,
}

const EWMA_ALPHA: f64 = 0.1;

/// In-process message bus with strict-priority dispatch.
pub struct MessageBus {
    config: BusConfig,
    lanes: Mutex<[VecDeque<QueuedMessage>; MessagePriority::LANES]>,
    depth: AtomicUsize,
    subscribers: DashMap<AgentId, Arc<dyn MessageHandler>>,
    pending_acks: DashMap<Uuid, PendingAck>,
    events: Arc<EventBus>,
    sent: AtomicU64,
    delivered: AtomicU64,
    errors: AtomicU64,
    acked: AtomicU64,
    ack_exhausted: AtomicU64,
    smoothed: Mutex<SmoothedStats>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
}

impl MessageBus {
    pub fn new(config: BusConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            lanes: Mutex::new(std::array::from_fn(|_| VecDeque::new())),
            depth: AtomicUsize::new(0),
            subscribers: DashMap::new(),
            pending_acks: DashMap::new(),
            events,
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            ack_exhausted: AtomicU64::new(0),
            smoothed: Mutex::new(SmoothedStats {
                throughput: 0.0,
                latency_ms: 0.0,
                delivered_since_tick: 0,
                last_tick: Instant::now(),
            }),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Start the dispatch loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            bus.dispatch_loop().await;
        });
        debug!(
            interval_ms = self.config.processing_interval_ms,
            "message bus started"
        );
    }

    /// Stop the dispatch loop. Queued messages stay in place and resume
    /// delivery on the next `start`.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.shutdown.notify_waiters();
            debug!("message bus stopped");
        }
    }

    /// Enqueue a directed message. Returns the message id synchronously;
    /// delivery happens on the dispatch loop.
    pub fn send(&self, message: Message) -> SwarmResult<Uuid> {
        if matches!(message.to, Recipient::Broadcast) {
            let id = message.id;
            self.broadcast(message)?;
            return Ok(id);
        }
        self.enqueue(message, 0)
    }

    /// Enqueue with jittered backoff while the queue is full.
    pub async fn send_with_retry(&self, message: Message, max_attempts: u32) -> SwarmResult<Uuid> {
        let mut delay_ms = 10u64;
        for attempt in 0.. {
            match self.send(message.clone()) {
                Err(SwarmError::QueueFull { .. }) if attempt < max_attempts => {
                    let jitter = rand::random::<u64>() % (delay_ms / 2 + 1);
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1_000);
                }
                other => return other,
            }
        }
        unreachable!("retry loop always returns");
    }

    /// Fan a message out to every subscriber other than the sender.
    ///
    /// Fan-out is best-effort: copies that hit a full queue are counted as
    /// errors, unsubscribed recipients simply do not exist to the loop.
    pub fn broadcast(&self, message: Message) -> SwarmResult<usize> {
        let mut recipients = 0;
        for entry in self.subscribers.iter() {
            if *entry.key() == message.from {
                continue;
            }
            let mut copy = message.clone();
            copy.id = Uuid::new_v4();
            copy.to = Recipient::Agent(entry.key().clone());
            copy.correlation_id = copy.correlation_id.or(Some(message.id));
            match self.enqueue(copy, 0) {
                Ok(_) => recipients += 1,
                Err(SwarmError::QueueFull { .. }) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recipients)
    }

    /// Register `handler` as the sole handler for `agent_id`, replacing any
    /// previous one.
    pub fn subscribe(&self, agent_id: AgentId, handler: Arc<dyn MessageHandler>) {
        self.subscribers.insert(agent_id, handler);
    }

    pub fn unsubscribe(&self, agent_id: &AgentId) {
        self.subscribers.remove(agent_id);
    }

    pub fn is_subscribed(&self, agent_id: &AgentId) -> bool {
        self.subscribers.contains_key(agent_id)
    }

    /// Mark a previously sent message as processed, cancelling redelivery.
    /// Acks for unknown (already resolved) messages are ignored.
    pub fn acknowledge(&self, ack: Ack) {
        if self.pending_acks.remove(&ack.message_id).is_some() {
            self.acked.fetch_add(1, Ordering::Relaxed);
            if let Some(error) = ack.error {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %ack.message_id, %error, "message processing failed at recipient");
            }
        } else {
            trace!(message_id = %ack.message_id, "ack for unknown message ignored");
        }
    }

    /// Current throughput and delivery statistics.
    pub fn stats(&self) -> BusStats {
        let smoothed = self.smoothed.lock();
        let acked = self.acked.load(Ordering::Relaxed);
        let exhausted = self.ack_exhausted.load(Ordering::Relaxed);
        let sent = self.sent.load(Ordering::Relaxed);
        BusStats {
            messages_per_second: smoothed.throughput,
            avg_delivery_latency_ms: smoothed.latency_ms,
            queue_depth: self.depth.load(Ordering::Relaxed),
            ack_rate: if acked + exhausted == 0 {
                1.0
            } else {
                acked as f64 / (acked + exhausted) as f64
            },
            error_rate: if sent == 0 {
                0.0
            } else {
                self.errors.load(Ordering::Relaxed) as f64 / sent as f64
            },
        }
    }

    /// Messages still awaiting acknowledgement.
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    fn enqueue(&self, message: Message, attempt: u32) -> SwarmResult<Uuid> {
        let depth = self.depth.load(Ordering::Relaxed);
        if depth >= self.config.max_queue_size {
            return Err(SwarmError::QueueFull {
                depth,
                max: self.config.max_queue_size,
            });
        }
        let id = message.id;
        if attempt == 0 {
            self.sent.fetch_add(1, Ordering::Relaxed);
            self.events.emit(SwarmEvent::new(
                EventKind::MessageSent,
                "bus",
                json!({
                    "message_id": id,
                    "kind": message.kind.to_string(),
                    "priority": message.priority,
                }),
            ));
        }
        let lane = message.priority.lane();
        self.lanes.lock()[lane].push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
            attempt,
        });
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_millis(self.config.processing_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.redeliver_unacked();
                    self.drain().await;
                    self.update_smoothed_stats();
                }
                _ = self.shutdown.notified() => break,
            }
        }
    }

    /// Requeue messages whose ack deadline passed; drop those out of budget.
    fn redeliver_unacked(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.pending_acks.iter() {
            if entry.value().deadline <= now {
                expired.push(*entry.key());
            }
        }
        for id in expired {
            let Some((_, pending)) = self.pending_acks.remove(&id) else {
                continue;
            };
            if pending.attempts > self.config.retry_attempts {
                self.ack_exhausted.fetch_add(1, Ordering::Relaxed);
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.events.emit(SwarmEvent::new(
                    EventKind::MessageError,
                    "bus",
                    json!({
                        "message_id": id,
                        "reason": "ack retries exhausted",
                        "attempts": pending.attempts,
                    }),
                ));
                warn!(message_id = %id, attempts = pending.attempts, "dropping unacked message");
            } else if self.enqueue_retry(pending.message, pending.attempts).is_err() {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn enqueue_retry(&self, message: Message, attempt: u32) -> SwarmResult<Uuid> {
        trace!(message_id = %message.id, attempt, "redelivering unacked message");
        self.enqueue(message, attempt)
    }

    /// Strict-priority drain: urgent first, then high, normal, low. Each
    /// lane is FIFO, which preserves per `(from, to)` pair ordering.
    async fn drain(&self) {
        loop {
            let queued = {
                let mut lanes = self.lanes.lock();
                let mut found = None;
                for lane in lanes.iter_mut().rev() {
                    if let Some(item) = lane.pop_front() {
                        found = Some(item);
                        break;
                    }
                }
                found
            };
            let Some(queued) = queued else { break };
            self.depth.fetch_sub(1, Ordering::Relaxed);
            self.deliver(queued).await;
        }
    }

    async fn deliver(&self, queued: QueuedMessage) {
        let QueuedMessage {
            message,
            enqueued_at,
            attempt,
        } = queued;

        if message.is_expired(Utc::now()) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            self.pending_acks.remove(&message.id);
            self.events.emit(SwarmEvent::new(
                EventKind::MessageError,
                "bus",
                json!({"message_id": message.id, "reason": "ttl expired"}),
            ));
            trace!(message_id = %message.id, "dropping expired message");
            return;
        }

        let Recipient::Agent(recipient) = &message.to else {
            return;
        };

        if message.requires_ack {
            self.pending_acks.insert(
                message.id,
                PendingAck {
                    message: message.clone(),
                    attempts: attempt + 1,
                    deadline: Instant::now() + Duration::from_millis(self.config.ack_timeout_ms),
                },
            );
        }

        let Some(handler) = self.subscribers.get(recipient).map(|h| h.value().clone()) else {
            // Unsubscribed recipient: silent no-op. An ack-required message
            // stays pending and retries in case the recipient appears.
            trace!(message_id = %message.id, to = %recipient, "no subscriber");
            return;
        };

        let message_id = message.id;
        let kind = message.kind.clone();
        match handler.handle(message).await {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                let latency_ms = enqueued_at.elapsed().as_secs_f64() * 1_000.0;
                {
                    let mut smoothed = self.smoothed.lock();
                    smoothed.delivered_since_tick += 1;
                    smoothed.latency_ms = if smoothed.latency_ms == 0.0 {
                        latency_ms
                    } else {
                        EWMA_ALPHA * latency_ms + (1.0 - EWMA_ALPHA) * smoothed.latency_ms
                    };
                }
                self.events.emit(SwarmEvent::new(
                    EventKind::MessageReceived,
                    "bus",
                    json!({"message_id": message_id, "kind": kind.to_string()}),
                ));
            }
            Err(e) => {
                // Handler failures are counted, never halt dispatch.
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(message_id = %message_id, error = %e, "message handler failed");
            }
        }
    }

    /// Remove and return every queued message in delivery order.
    #[cfg(feature = "persistence")]
    pub fn drain_for_flush(&self) -> Vec<Message> {
        let mut lanes = self.lanes.lock();
        let mut drained = Vec::new();
        for lane in lanes.iter_mut().rev() {
            while let Some(item) = lane.pop_front() {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                drained.push(item.message);
            }
        }
        drained
    }

    fn update_smoothed_stats(&self) {
        let mut smoothed = self.smoothed.lock();
        let elapsed = smoothed.last_tick.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let rate = smoothed.delivered_since_tick as f64 / elapsed;
        smoothed.throughput = if smoothed.throughput == 0.0 {
            rate
        } else {
            EWMA_ALPHA * rate + (1.0 - EWMA_ALPHA) * smoothed.throughput
        };
        smoothed.delivered_since_tick = 0;
        smoothed.last_tick = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waggle_core::{AgentKind, IdAllocator};

    fn bus_with(config: BusConfig) -> Arc<MessageBus> {
        Arc::new(MessageBus::new(config, Arc::new(EventBus::new())))
    }

    fn agent_id() -> AgentId {
        IdAllocator::new(Uuid::new_v4()).agent_id(AgentKind::Worker)
    }

    #[tokio::test]
    async fn queue_full_surfaces_to_caller() {
        let bus = bus_with(BusConfig {
            max_queue_size: 1,
            ..BusConfig::default()
        });
        let from = agent_id();
        let to = agent_id();
        let msg = || {
            Message::new(
                MessageKind::Heartbeat,
                from.clone(),
                Recipient::Agent(to.clone()),
                serde_json::Value::Null,
            )
        };
        bus.send(msg()).unwrap();
        assert!(matches!(
            bus.send(msg()),
            Err(SwarmError::QueueFull { depth: 1, max: 1 })
        ));
    }

    #[tokio::test]
    async fn directed_delivery_reaches_subscriber() {
        let bus = bus_with(BusConfig {
            processing_interval_ms: 5,
            ..BusConfig::default()
        });
        let from = agent_id();
        let to = agent_id();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(to.clone(), Arc::new(tx));
        bus.start();

        bus.send(Message::new(
            MessageKind::TaskAssign,
            from,
            Recipient::Agent(to),
            json!({"task": "t1"}),
        ))
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, MessageKind::TaskAssign);
        bus.stop();
    }

    #[tokio::test]
    async fn higher_priority_preempts_within_a_tick() {
        let bus = bus_with(BusConfig {
            processing_interval_ms: 20,
            ..BusConfig::default()
        });
        let from = agent_id();
        let to = agent_id();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(to.clone(), Arc::new(tx));

        // Enqueue before starting so both land in the same drain pass.
        bus.send(
            Message::new(
                MessageKind::StatusUpdate,
                from.clone(),
                Recipient::Agent(to.clone()),
                json!("low"),
            )
            .with_priority(MessagePriority::Low),
        )
        .unwrap();
        bus.send(
            Message::new(
                MessageKind::TaskCancel,
                from,
                Recipient::Agent(to),
                json!("urgent"),
            )
            .with_priority(MessagePriority::Urgent),
        )
        .unwrap();
        bus.start();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.priority, MessagePriority::Urgent);
        bus.stop();
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered_then_dropped() {
        let events = Arc::new(EventBus::new());
        let bus = Arc::new(MessageBus::new(
            BusConfig {
                processing_interval_ms: 5,
                ack_timeout_ms: 20,
                retry_attempts: 1,
                ..BusConfig::default()
            },
            events.clone(),
        ));
        let mut error_events = events.subscribe(EventKind::MessageError);
        let from = agent_id();
        let to = agent_id();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(to.clone(), Arc::new(tx));
        bus.start();

        bus.send(
            Message::new(
                MessageKind::TaskAssign,
                from,
                Recipient::Agent(to),
                serde_json::Value::Null,
            )
            .with_ack(),
        )
        .unwrap();

        // Initial delivery plus one retry, never acked.
        let mut deliveries = 0;
        while tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            deliveries += 1;
        }
        assert_eq!(deliveries, 2);

        let error = tokio::time::timeout(Duration::from_secs(1), error_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.data["reason"], "ack retries exhausted");
        assert_eq!(bus.pending_ack_count(), 0);
        bus.stop();
    }

    #[tokio::test]
    async fn ack_cancels_redelivery() {
        let bus = bus_with(BusConfig {
            processing_interval_ms: 5,
            ack_timeout_ms: 30,
            retry_attempts: 3,
            ..BusConfig::default()
        });
        let from = agent_id();
        let to = agent_id();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(to.clone(), Arc::new(tx));
        bus.start();

        bus.send(
            Message::new(
                MessageKind::TaskAssign,
                from,
                Recipient::Agent(to.clone()),
                serde_json::Value::Null,
            )
            .with_ack(),
        )
        .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        bus.acknowledge(Ack::success(&received, to));
        assert_eq!(bus.pending_ack_count(), 0);

        // No redelivery after the ack.
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        bus.stop();
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_unsubscribed() {
        let bus = bus_with(BusConfig {
            processing_interval_ms: 5,
            ..BusConfig::default()
        });
        let sender = agent_id();
        let other = agent_id();
        let (sender_tx, mut sender_rx) = tokio::sync::mpsc::unbounded_channel();
        let (other_tx, mut other_rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(sender.clone(), Arc::new(sender_tx));
        bus.subscribe(other.clone(), Arc::new(other_tx));
        bus.start();

        let recipients = bus
            .broadcast(Message::new(
                MessageKind::Broadcast,
                sender.clone(),
                Recipient::Broadcast,
                json!("hello"),
            ))
            .unwrap();
        assert_eq!(recipients, 1);

        let received = tokio::time::timeout(Duration::from_secs(1), other_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload, json!("hello"));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sender_rx.recv())
                .await
                .is_err()
        );
        bus.stop();
    }

    #[tokio::test]
    async fn expired_message_is_dropped_and_counted() {
        let bus = bus_with(BusConfig {
            processing_interval_ms: 5,
            ..BusConfig::default()
        });
        let from = agent_id();
        let to = agent_id();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(to.clone(), Arc::new(tx));

        let mut msg = Message::new(
            MessageKind::StatusUpdate,
            from,
            Recipient::Agent(to),
            serde_json::Value::Null,
        )
        .with_ttl_ms(10);
        msg.timestamp = Utc::now() - chrono::Duration::seconds(1);
        bus.send(msg).unwrap();
        bus.start();

        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert!(bus.stats().error_rate > 0.0);
        bus.stop();
    }

    #[tokio::test]
    async fn handler_failure_does_not_halt_dispatch() {
        struct FailingHandler;
        #[async_trait]
        impl MessageHandler for FailingHandler {
            async fn handle(&self, _message: Message) -> SwarmResult<()> {
                Err(SwarmError::HandlerFailure("boom".into()))
            }
        }

        let bus = bus_with(BusConfig {
            processing_interval_ms: 5,
            ..BusConfig::default()
        });
        let from = agent_id();
        let failing = agent_id();
        let healthy = agent_id();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(failing.clone(), Arc::new(FailingHandler));
        bus.subscribe(healthy.clone(), Arc::new(tx));
        bus.start();

        bus.send(Message::new(
            MessageKind::StatusUpdate,
            from.clone(),
            Recipient::Agent(failing),
            serde_json::Value::Null,
        ))
        .unwrap();
        bus.send(Message::new(
            MessageKind::StatusUpdate,
            from,
            Recipient::Agent(healthy),
            serde_json::Value::Null,
        ))
        .unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_some());
        assert!(bus.stats().error_rate > 0.0);
        bus.stop();
    }
}
