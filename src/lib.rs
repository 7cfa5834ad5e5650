pub mod config;
pub mod coordinator;
pub mod decompose;
pub mod directory;
pub mod dispatch;
pub mod distribution;
pub mod error;
pub mod negotiation;
pub mod registry;
pub mod scoring;
pub mod timer;
pub mod workflow;

pub use config::MeshConfig;
pub use coordinator::Coordinator;
pub use decompose::{
    ComplexityClass, Priority, SubTask, SubTaskStatus, TaskDecomposer, TaskDecomposition,
};
pub use directory::{AgentDirectory, AgentInfo, AgentStatus, InMemoryDirectory};
pub use dispatch::{DispatchAction, DispatchChannel, StateMirror, TaskDispatch};
pub use distribution::{
    DistributionMetrics, TaskAssignment, TaskDistributor, TaskEvent, TaskRequest,
};
pub use error::{MeshError, Result};
pub use negotiation::{
    CollaborationAgreement, ConflictDetector, NegotiationEngine, NegotiationKind,
    NegotiationOffer, NegotiationOutcome, NegotiationRequest, NegotiationStatus, OfferResponse,
    ResourceConflict,
};
pub use registry::{CapabilityRegistry, TaskCapability};
pub use scoring::{AgentCapabilityScore, CapabilityScorer, PerformanceTracker};
pub use workflow::{WorkflowExecutor, WorkflowSnapshot, WorkflowStatus};
