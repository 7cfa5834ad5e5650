//! Task queue ownership, agent selection, dispatch, timeout monitoring and
//! load rebalancing.

mod distributor;
mod queue;
mod types;

pub use distributor::TaskDistributor;
pub use queue::QueuedTask;
pub use types::{
    AssignmentStatus, DistributionMetrics, TaskAssignment, TaskEvent, TaskRequest,
};
