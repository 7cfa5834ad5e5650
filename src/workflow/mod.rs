//! Workflow execution over decomposition DAGs.

mod executor;
mod graph;

pub use executor::{WorkflowExecutor, WorkflowSnapshot, WorkflowStatus};
pub use graph::{DagCounts, TaskDag};
