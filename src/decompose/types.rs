use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Priority of a decomposition or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Base score feeding the distributor's effective-priority computation.
    pub fn base_score(&self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// Critical and High tasks bypass the queue and distribute immediately.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// Complexity class of an objective, scaling template durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl ComplexityClass {
    /// Parse a caller-supplied class name. Unknown classes default to Medium.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "simple" | "low" => Self::Simple,
            "complex" | "high" => Self::Complex,
            _ => Self::Medium,
        }
    }
}

/// Lifecycle of a subtask. Reaches Completed or Failed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskStatus {
    #[default]
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl SubTaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal forward transitions; states are never skipped.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Assigned)
                | (Self::Assigned, Self::InProgress)
                | (Self::Assigned, Self::Pending)
                | (Self::Assigned, Self::Completed)
                | (Self::Assigned, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

/// Kind of dependency edge between two subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Prerequisite must finish before the dependent starts.
    Sequential,
    /// Prerequisite runs alongside siblings but still gates the dependent.
    Parallel,
    /// Dependent runs only if the prerequisite succeeded.
    Conditional,
}

/// A dependency edge in a decomposition's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDependency {
    pub prerequisite: String,
    pub dependent: String,
    pub kind: DependencyKind,
}

/// One unit of work produced by decomposition. Never deleted, only
/// terminal-stamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub required_capabilities: BTreeSet<String>,
    pub estimated_duration_minutes: u32,
    pub status: SubTaskStatus,
    pub assigned_agent: Option<String>,
    pub result: Option<String>,
}

impl SubTask {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            required_capabilities: BTreeSet::new(),
            estimated_duration_minutes: 30,
            status: SubTaskStatus::Pending,
            assigned_agent: None,
            result: None,
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

    pub fn with_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration_minutes = minutes;
        self
    }
}

/// The DAG of subtasks produced for one objective. Owned by the coordinator
/// for the lifetime of its workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDecomposition {
    pub id: String,
    pub objective: String,
    pub subtasks: Vec<SubTask>,
    pub dependencies: Vec<TaskDependency>,
    pub estimated_total_minutes: u32,
    pub required_capabilities: BTreeSet<String>,
    pub priority: Priority,
    pub constraints: Vec<String>,
}

impl TaskDecomposition {
    pub fn subtask(&self, id: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|t| t.id == id)
    }

    pub fn subtask_by_name(&self, name: &str) -> Option<&SubTask> {
        self.subtasks.iter().find(|t| t.name == name)
    }

    /// Prerequisite ids of one subtask.
    pub fn prerequisites_of(&self, id: &str) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.dependent == id)
            .map(|d| d.prerequisite.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_base_scores() {
        assert_eq!(Priority::Low.base_score(), 1);
        assert_eq!(Priority::Medium.base_score(), 2);
        assert_eq!(Priority::High.base_score(), 3);
        assert_eq!(Priority::Critical.base_score(), 4);
        assert!(Priority::Critical.is_urgent());
        assert!(!Priority::Medium.is_urgent());
    }

    #[test]
    fn unknown_complexity_defaults_to_medium() {
        assert_eq!(ComplexityClass::parse("complex"), ComplexityClass::Complex);
        assert_eq!(ComplexityClass::parse("weird"), ComplexityClass::Medium);
        assert_eq!(ComplexityClass::parse(""), ComplexityClass::Medium);
    }

    #[test]
    fn status_transitions_never_skip_states() {
        use SubTaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        // Requeue after a timed-out assignment.
        assert!(Assigned.can_transition_to(Pending));
        // Terminal stamps for assignments that never reported a start.
        assert!(Assigned.can_transition_to(Failed));
        assert!(Assigned.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }
}
