//! Task model and its status state machine

use crate::{
    error::{SwarmError, SwarmResult},
    ids::{AgentId, TaskId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of work a task represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Analysis,
    Coding,
    Testing,
    Review,
    Documentation,
    Coordination,
    Consensus,
    Custom(String),
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Research => f.write_str("research"),
            TaskKind::Analysis => f.write_str("analysis"),
            TaskKind::Coding => f.write_str("coding"),
            TaskKind::Testing => f.write_str("testing"),
            TaskKind::Review => f.write_str("review"),
            TaskKind::Documentation => f.write_str("documentation"),
            TaskKind::Coordination => f.write_str("coordination"),
            TaskKind::Consensus => f.write_str("consensus"),
            TaskKind::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

/// Scheduling priority of a task. Orders from `Background` (lowest) up to
/// `Critical` so that `Ord` agrees with urgency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle status of a task.
///
/// ```text
/// created → queued → assigned → running → completed
///                                ↘        ↘ failed (terminal)
///                                ↘ timeout (terminal)
/// assigned/running → queued      (retry)
/// any non-terminal → cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Assigned,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Whether the state machine permits `self → to`.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        if to == Cancelled {
            return true;
        }
        match self {
            Created => matches!(to, Queued | Assigned),
            Queued => matches!(to, Assigned),
            // A completion report may arrive before an explicit start.
            Assigned => matches!(to, Running | Completed | Failed | Timeout | Queued),
            Running => matches!(to, Paused | Completed | Failed | Timeout | Queued),
            Paused => matches!(to, Running),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Submission payload: a task minus its allocated id, status and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: TaskKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub input: serde_json::Value,
    /// Per-task timeout override in milliseconds; 0 uses the swarm default.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "TaskSpec::default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskSpec {
    fn default_max_retries() -> u32 {
        crate::DEFAULT_MAX_RETRIES
    }

    pub fn new(kind: TaskKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            description: String::new(),
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            input: serde_json::Value::Null,
            timeout_ms: 0,
            max_retries: crate::DEFAULT_MAX_RETRIES,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Live state of a task, owned exclusively by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: TaskId,
    pub kind: TaskKind,
    pub name: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_to: Option<AgentId>,
    pub dependencies: Vec<TaskId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub max_retries: u32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TaskState {
    pub fn from_spec(id: TaskId, spec: TaskSpec, default_timeout_ms: u64) -> Self {
        let timeout_ms = if spec.timeout_ms == 0 {
            default_timeout_ms
        } else {
            spec.timeout_ms
        };
        Self {
            id,
            kind: spec.kind,
            name: spec.name,
            description: spec.description,
            priority: spec.priority,
            status: TaskStatus::Created,
            assigned_to: None,
            dependencies: spec.dependencies,
            input: spec.input,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_ms,
            retries: 0,
            max_retries: spec.max_retries,
            metadata: spec.metadata,
        }
    }

    /// Advance the status, enforcing the state machine.
    pub fn transition(&mut self, to: TaskStatus) -> SwarmResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(SwarmError::IllegalTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
            | TaskStatus::Timeout => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Queued => {
                // Re-queue for retry: the previous assignee is forgotten.
                self.assigned_to = None;
            }
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Whether another retry is within budget.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Wall-clock duration from start (or creation) to completion.
    pub fn duration_ms(&self) -> Option<u64> {
        let end = self.completed_at?;
        let start = self.started_at.unwrap_or(self.created_at);
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}
