//! Message and acknowledgement types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use waggle_core::AgentId;

/// Delivery priority of a message. Orders from `Low` up to `Urgent` so the
/// lane index falls out of the discriminant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    /// Number of priority lanes.
    pub const LANES: usize = 4;

    /// Index of this priority's lane, `0` = lowest.
    pub fn lane(&self) -> usize {
        *self as usize
    }
}

/// Kind of message on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskAssign,
    TaskCancel,
    TaskComplete,
    TaskFail,
    Heartbeat,
    StatusUpdate,
    ConsensusProposal,
    ConsensusVote,
    ConsensusResult,
    Broadcast,
    Error,
    Custom(String),
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::TaskAssign => f.write_str("task_assign"),
            MessageKind::TaskCancel => f.write_str("task_cancel"),
            MessageKind::TaskComplete => f.write_str("task_complete"),
            MessageKind::TaskFail => f.write_str("task_fail"),
            MessageKind::Heartbeat => f.write_str("heartbeat"),
            MessageKind::StatusUpdate => f.write_str("status_update"),
            MessageKind::ConsensusProposal => f.write_str("consensus_proposal"),
            MessageKind::ConsensusVote => f.write_str("consensus_vote"),
            MessageKind::ConsensusResult => f.write_str("consensus_result"),
            MessageKind::Broadcast => f.write_str("broadcast"),
            MessageKind::Error => f.write_str("error"),
            MessageKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Addressee of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(AgentId),
    Broadcast,
}

/// A directed, prioritised message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub from: AgentId,
    pub to: Recipient,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub priority: MessagePriority,
    pub requires_ack: bool,
    /// Wall-clock expiry from `timestamp`, in milliseconds.
    pub ttl_ms: u64,
    pub correlation_id: Option<Uuid>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        from: AgentId,
        to: Recipient,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from,
            to,
            payload,
            timestamp: Utc::now(),
            priority: MessagePriority::Normal,
            requires_ack: false,
            ttl_ms: waggle_core::DEFAULT_MESSAGE_TTL_MS,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Build a reply, correlating it to this message.
    pub fn reply(&self, kind: MessageKind, from: AgentId, payload: serde_json::Value) -> Self {
        Self::new(kind, from, Recipient::Agent(self.from.clone()), payload)
            .with_correlation(self.id)
    }

    /// Whether the message has outlived its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age_ms = (now - self.timestamp).num_milliseconds();
        age_ms >= 0 && age_ms as u64 >= self.ttl_ms
    }
}

/// Acknowledgement of a previously sent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: Uuid,
    pub from: AgentId,
    pub received: bool,
    pub processed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl Ack {
    /// Acknowledge successful processing of `message` by `from`.
    pub fn success(message: &Message, from: AgentId) -> Self {
        Self {
            message_id: message.id,
            from,
            received: true,
            processed_at: Utc::now(),
            error: None,
        }
    }

    /// Acknowledge receipt of `message` with a processing failure.
    pub fn failure(message: &Message, from: AgentId, error: impl Into<String>) -> Self {
        Self {
            message_id: message.id,
            from,
            received: true,
            processed_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use waggle_core::{AgentKind, IdAllocator};

    fn sender() -> AgentId {
        IdAllocator::new(Uuid::new_v4()).agent_id(AgentKind::Coder)
    }

    #[test]
    fn lanes_follow_priority_order() {
        assert!(MessagePriority::Urgent.lane() > MessagePriority::High.lane());
        assert!(MessagePriority::High.lane() > MessagePriority::Normal.lane());
        assert!(MessagePriority::Normal.lane() > MessagePriority::Low.lane());
    }

    #[test]
    fn ttl_expiry_is_wall_clock() {
        let mut msg = Message::new(
            MessageKind::Heartbeat,
            sender(),
            Recipient::Broadcast,
            serde_json::Value::Null,
        )
        .with_ttl_ms(1_000);
        assert!(!msg.is_expired(Utc::now()));
        msg.timestamp = Utc::now() - Duration::seconds(2);
        assert!(msg.is_expired(Utc::now()));
    }

    #[test]
    fn reply_correlates_to_original() {
        let a = sender();
        let b = sender();
        let msg = Message::new(
            MessageKind::TaskAssign,
            a.clone(),
            Recipient::Agent(b.clone()),
            serde_json::Value::Null,
        );
        let reply = msg.reply(MessageKind::TaskComplete, b, serde_json::Value::Null);
        assert_eq!(reply.correlation_id, Some(msg.id));
        assert_eq!(reply.to, Recipient::Agent(a));
    }
}
