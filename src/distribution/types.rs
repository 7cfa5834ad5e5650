use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decompose::{Priority, SubTask};

/// A schedulable unit of work as the distributor sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub name: String,
    pub description: String,
    pub required_capabilities: BTreeSet<String>,
    /// Relative complexity in `[0, 1]`, feeding the load-factor model.
    pub complexity: f64,
    pub priority: Priority,
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: Priority) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            description: name.clone(),
            name,
            required_capabilities: BTreeSet::new(),
            complexity: 0.5,
            priority,
            deadline: None,
        }
    }

    pub fn from_subtask(subtask: &SubTask, priority: Priority, complexity: f64) -> Self {
        Self {
            id: subtask.id.clone(),
            name: subtask.name.clone(),
            description: subtask.description.clone(),
            required_capabilities: subtask.required_capabilities.clone(),
            complexity: complexity.clamp(0.0, 1.0),
            priority,
            deadline: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity.clamp(0.0, 1.0);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Task type used to filter performance history: the first required
    /// capability, falling back to the task name.
    pub fn task_type(&self) -> &str {
        self.required_capabilities
            .iter()
            .next()
            .map(String::as_str)
            .unwrap_or(&self.name)
    }
}

/// Lifecycle of one assignment. A superseded assignment transitions to
/// Reassigned; only one assignment per task is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
    Reassigned,
}

impl AssignmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Reassigned)
    }

    /// Still waiting on the agent; subject to timeout and rebalancing.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }
}

/// An agent working (or having worked) one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub agent_id: String,
    pub assigned_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    pub status: AssignmentStatus,
    pub actual_completion: Option<DateTime<Utc>>,
    /// Estimated/actual duration ratio, recorded on completion.
    pub performance: Option<f64>,
    /// Suitability score at assignment time.
    pub score: f64,
}

/// Events broadcast by the distributor for the workflow executor and any
/// other observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Dispatched {
        task_id: String,
        agent_id: String,
    },
    /// The agent acknowledged the assignment and began working.
    Started {
        task_id: String,
        agent_id: String,
    },
    Completed {
        task_id: String,
        agent_id: String,
        success: bool,
        elapsed_ms: u64,
    },
    Reassigned {
        task_id: String,
        from_agent: String,
        to_agent: String,
    },
    /// Retries exhausted; the task will not be re-queued again.
    TerminallyFailed {
        task_id: String,
    },
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributionMetrics {
    pub tasks_submitted: u64,
    pub tasks_dispatched: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub timeouts: u64,
    pub reassignments: u64,
    pub total_completion_ms: u64,
    /// `1 - variance(load factors)`, refreshed each rebalancing cycle.
    pub load_balance_score: f64,
}

impl DistributionMetrics {
    pub fn avg_completion_ms(&self) -> u64 {
        if self.tasks_completed == 0 {
            0
        } else {
            self.total_completion_ms / self.tasks_completed
        }
    }
}
