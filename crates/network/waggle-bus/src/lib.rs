//! # Waggle Bus
//!
//! Typed in-process message transport for swarm agents: four strict-priority
//! lanes with per-lane FIFO delivery, acknowledgement with bounded retry,
//! per-recipient subscriptions and broadcast fan-out.
//!
//! The bus never blocks its caller beyond the enqueue: `send` returns the
//! assigned message id synchronously and a background dispatch loop drains
//! the lanes at the configured processing interval.

pub mod bus;
pub mod message;

#[cfg(feature = "persistence")]
pub mod persist;

pub use bus::{BusConfig, BusStats, MessageBus, MessageHandler};
pub use message::{Ack, Message, MessageKind, MessagePriority, Recipient};
