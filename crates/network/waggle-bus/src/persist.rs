//! Optional queue persistence
//!
//! When `enable_persistence` is set, callers may flush the queued messages
//! to a `StateStore` before shutdown and replay them after restart. Replayed
//! messages keep their original timestamp, so the TTL clock keeps running
//! across the restart.

use crate::{bus::MessageBus, message::Message};
use serde_json::json;
use waggle_core::{StateStore, SwarmError, SwarmResult};

impl MessageBus {
    /// Drain every queued message, in delivery order, into `store`.
    pub async fn flush_to(&self, store: &dyn StateStore) -> SwarmResult<usize> {
        let messages = self.drain_for_flush();
        let count = messages.len();
        let snapshot = json!({ "messages": messages });
        store.save(&snapshot).await?;
        Ok(count)
    }

    /// Re-enqueue messages previously flushed with [`flush_to`].
    ///
    /// [`flush_to`]: MessageBus::flush_to
    pub async fn replay_from(&self, store: &dyn StateStore) -> SwarmResult<usize> {
        let Some(snapshot) = store.load().await? else {
            return Ok(0);
        };
        let messages: Vec<Message> = serde_json::from_value(
            snapshot
                .get("messages")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| SwarmError::Storage(format!("invalid bus snapshot: {e}")))?;
        let mut replayed = 0;
        for message in messages {
            self.send(message)?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BusConfig, MessageKind, Recipient};
    use std::sync::Arc;
    use uuid::Uuid;
    use waggle_core::{AgentKind, EventBus, IdAllocator, InMemoryStateStore};

    #[tokio::test]
    async fn flush_then_replay_preserves_order_and_ttl() {
        let events = Arc::new(EventBus::new());
        let bus = MessageBus::new(BusConfig::default(), events.clone());
        let alloc = IdAllocator::new(Uuid::new_v4());
        let from = alloc.agent_id(AgentKind::Worker);
        let to = alloc.agent_id(AgentKind::Worker);

        let first = Message::new(
            MessageKind::TaskAssign,
            from.clone(),
            Recipient::Agent(to.clone()),
            serde_json::json!(1),
        )
        .with_ttl_ms(120_000);
        let second = Message::new(
            MessageKind::TaskAssign,
            from,
            Recipient::Agent(to),
            serde_json::json!(2),
        );
        let first_ts = first.timestamp;
        bus.send(first).unwrap();
        bus.send(second).unwrap();

        let store = InMemoryStateStore::new();
        assert_eq!(bus.flush_to(&store).await.unwrap(), 2);
        assert_eq!(bus.stats().queue_depth, 0);

        let restarted = MessageBus::new(BusConfig::default(), events);
        assert_eq!(restarted.replay_from(&store).await.unwrap(), 2);
        let replayed = restarted.drain_for_flush();
        assert_eq!(replayed[0].payload, serde_json::json!(1));
        // Original timestamp survives, so the TTL keeps its original expiry.
        assert_eq!(replayed[0].timestamp, first_ts);
        assert_eq!(replayed[0].ttl_ms, 120_000);
    }
}
