//! Error types shared across the swarm engine

use thiserror::Error;

/// Result type for swarm operations
pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

/// Errors that can occur during swarm coordination.
///
/// Timeouts and TTL expiries are modelled as first-class entity states, not
/// errors; the variants here are what actually surfaces to a caller.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// A pool, agent map, task map or queue is at its configured limit.
    #[error("{resource} capacity exceeded: {current} >= {max}")]
    CapacityExceeded {
        resource: &'static str,
        current: usize,
        max: usize,
    },

    /// Lookup of an unknown entity where absence cannot be a no-op.
    #[error("unknown {entity}: {id}")]
    UnknownEntity { entity: &'static str, id: String },

    /// A cross-component request exceeded its deadline.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// The message bus rejected a send because the queue is full.
    #[error("message queue full: {depth} >= {max}")]
    QueueFull { depth: usize, max: usize },

    /// A subscriber handler returned an error; counted, never fatal.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// An operation was requested from a state that does not permit it.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Configuration failed validation; the component refuses to initialise.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Consensus could not be achieved.
    #[error("consensus failure: {0}")]
    ConsensusFailure(String),

    /// State store I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Other errors
    #[error("swarm error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SwarmError {
    /// Shorthand for an unknown-agent lookup failure.
    pub fn unknown_agent(id: impl ToString) -> Self {
        SwarmError::UnknownEntity {
            entity: "agent",
            id: id.to_string(),
        }
    }

    /// Shorthand for an unknown-task lookup failure.
    pub fn unknown_task(id: impl ToString) -> Self {
        SwarmError::UnknownEntity {
            entity: "task",
            id: id.to_string(),
        }
    }
}
