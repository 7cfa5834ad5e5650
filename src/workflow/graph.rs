//! Arena-style execution graph for one decomposition.

use std::collections::HashMap;

use crate::decompose::{SubTask, SubTaskStatus, TaskDecomposition};

struct DagNode {
    subtask: SubTask,
    prerequisites: Vec<String>,
    dependents: Vec<String>,
    /// Handed to the distributor; stays true until a terminal stamp.
    dispatched: bool,
    /// A prerequisite failed; this node will never run.
    blocked: bool,
}

/// Id-indexed view of a decomposition used to drive execution order.
pub struct TaskDag {
    nodes: HashMap<String, DagNode>,
    order: Vec<String>,
}

impl TaskDag {
    pub fn from_decomposition(decomposition: &TaskDecomposition) -> Self {
        let mut nodes: HashMap<String, DagNode> = decomposition
            .subtasks
            .iter()
            .map(|subtask| {
                (
                    subtask.id.clone(),
                    DagNode {
                        subtask: subtask.clone(),
                        prerequisites: Vec::new(),
                        dependents: Vec::new(),
                        dispatched: false,
                        blocked: false,
                    },
                )
            })
            .collect();
        for edge in &decomposition.dependencies {
            if let Some(node) = nodes.get_mut(&edge.dependent) {
                node.prerequisites.push(edge.prerequisite.clone());
            }
            if let Some(node) = nodes.get_mut(&edge.prerequisite) {
                node.dependents.push(edge.dependent.clone());
            }
        }
        Self {
            order: decomposition.subtasks.iter().map(|t| t.id.clone()).collect(),
            nodes,
        }
    }

    /// Subtasks ready to dispatch: pending, unblocked, not yet handed out,
    /// with every prerequisite completed.
    pub fn ready_set(&self) -> Vec<&SubTask> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| {
                node.subtask.status == SubTaskStatus::Pending
                    && !node.blocked
                    && !node.dispatched
                    && node.prerequisites.iter().all(|p| {
                        self.nodes
                            .get(p)
                            .map(|n| n.subtask.status == SubTaskStatus::Completed)
                            .unwrap_or(false)
                    })
            })
            .map(|node| &node.subtask)
            .collect()
    }

    pub fn mark_dispatched(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.dispatched = true;
        }
    }

    /// Return a node to the ready set after a failed hand-off.
    pub fn clear_dispatched(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.dispatched = false;
        }
    }

    pub fn mark_assigned(&mut self, id: &str, agent_id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.subtask.status = SubTaskStatus::Assigned;
            node.subtask.assigned_agent = Some(agent_id.to_string());
        }
    }

    pub fn mark_in_progress(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.subtask.status = SubTaskStatus::InProgress;
        }
    }

    /// Terminal-stamp a subtask. A failure blocks its dependents
    /// transitively; independent branches are untouched.
    pub fn mark_finished(&mut self, id: &str, success: bool, result: Option<String>) {
        let dependents = {
            let Some(node) = self.nodes.get_mut(id) else {
                return;
            };
            node.subtask.status = if success {
                SubTaskStatus::Completed
            } else {
                SubTaskStatus::Failed
            };
            node.subtask.result = result;
            if success {
                return;
            }
            node.dependents.clone()
        };
        let mut frontier = dependents;
        while let Some(dependent) = frontier.pop() {
            if let Some(node) = self.nodes.get_mut(&dependent)
                && !node.blocked
            {
                node.blocked = true;
                frontier.extend(node.dependents.iter().cloned());
            }
        }
    }

    pub fn subtask(&self, id: &str) -> Option<&SubTask> {
        self.nodes.get(id).map(|n| &n.subtask)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.nodes.get(id).map(|n| n.blocked).unwrap_or(false)
    }

    /// The workflow is settled once every subtask is terminal or blocked.
    pub fn is_settled(&self) -> bool {
        self.nodes.values().all(|node| {
            node.blocked
                || matches!(
                    node.subtask.status,
                    SubTaskStatus::Completed | SubTaskStatus::Failed
                )
        })
    }

    pub fn counts(&self) -> DagCounts {
        let mut counts = DagCounts::default();
        for node in self.nodes.values() {
            if node.blocked {
                counts.blocked += 1;
            } else {
                match node.subtask.status {
                    SubTaskStatus::Completed => counts.completed += 1,
                    SubTaskStatus::Failed => counts.failed += 1,
                    SubTaskStatus::Pending => counts.pending += 1,
                    SubTaskStatus::Assigned | SubTaskStatus::InProgress => counts.running += 1,
                }
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DagCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}
