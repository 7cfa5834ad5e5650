//! Objective decomposition into a dependency graph of subtasks.

mod decomposer;
mod templates;
mod types;

pub use decomposer::TaskDecomposer;
pub use templates::ObjectiveTemplate;
pub use types::{
    ComplexityClass, DependencyKind, Priority, SubTask, SubTaskStatus, TaskDecomposition,
    TaskDependency,
};
