//! Shared test harnesses: scripted agents behind the bus
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use waggle_swarm::bus::{Ack, Message, MessageBus, MessageHandler, MessageKind, Recipient};
use waggle_swarm::core::{AgentId, SwarmResult};

/// Install a test logger once per binary; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An agent that acknowledges `task_assign` and reports back after an
/// optional working delay. The first `fail_times` assignments fail with a
/// transient error.
pub struct ScriptedWorker {
    bus: Arc<MessageBus>,
    control: AgentId,
    id: AgentId,
    delay_ms: u64,
    fail_times: AtomicU32,
    output: serde_json::Value,
}

impl ScriptedWorker {
    pub fn new(bus: Arc<MessageBus>, control: AgentId, id: AgentId) -> Self {
        Self {
            bus,
            control,
            id,
            delay_ms: 0,
            fail_times: AtomicU32::new(0),
            output: json!("ok"),
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn failing_first(self, times: u32) -> Self {
        self.fail_times.store(times, Ordering::SeqCst);
        self
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }
}

#[async_trait]
impl MessageHandler for ScriptedWorker {
    async fn handle(&self, message: Message) -> SwarmResult<()> {
        if message.kind != MessageKind::TaskAssign {
            return Ok(());
        }
        self.bus.acknowledge(Ack::success(&message, self.id.clone()));

        let task_id = message.payload["task_id"].clone();
        let should_fail = self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let bus = self.bus.clone();
        let control = self.control.clone();
        let id = self.id.clone();
        let delay_ms = self.delay_ms;
        let output = self.output.clone();

        // Work happens off the dispatch loop, like a real agent would.
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            let reply = if should_fail {
                Message::new(
                    MessageKind::TaskFail,
                    id,
                    Recipient::Agent(control),
                    json!({"task_id": task_id, "error": "transient"}),
                )
            } else {
                Message::new(
                    MessageKind::TaskComplete,
                    id,
                    Recipient::Agent(control),
                    json!({"task_id": task_id, "output": output}),
                )
            };
            let _ = bus.send(reply);
        });
        Ok(())
    }
}

/// An agent that votes on every consensus proposal it hears about.
pub struct ScriptedVoter {
    bus: Arc<MessageBus>,
    control: AgentId,
    id: AgentId,
    /// `None` abstains.
    approve: Option<bool>,
}

impl ScriptedVoter {
    pub fn new(bus: Arc<MessageBus>, control: AgentId, id: AgentId, approve: Option<bool>) -> Self {
        Self {
            bus,
            control,
            id,
            approve,
        }
    }
}

#[async_trait]
impl MessageHandler for ScriptedVoter {
    async fn handle(&self, message: Message) -> SwarmResult<()> {
        if message.kind != MessageKind::ConsensusProposal {
            return Ok(());
        }
        let Some(approve) = self.approve else {
            return Ok(());
        };
        let vote = Message::new(
            MessageKind::ConsensusVote,
            self.id.clone(),
            Recipient::Agent(self.control.clone()),
            json!({
                "proposal_id": message.payload["proposal_id"],
                "approve": approve,
                "confidence": 1.0,
            }),
        );
        let _ = self.bus.send(vote);
        Ok(())
    }
}
