use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Invalid objective: {0}")]
    InvalidObjective(String),

    #[error("No viable agent for task {task_id} (best score {best_score:.2})")]
    NoViableAgent { task_id: String, best_score: f64 },

    #[error("Assignment timed out: task {task_id} on agent {agent_id} after {elapsed_ms}ms")]
    AssignmentTimeout {
        task_id: String,
        agent_id: String,
        elapsed_ms: u64,
    },

    #[error("Max retries exceeded for task: {0}")]
    MaxRetriesExceeded(String),

    #[error("Negotiation timed out: {0}")]
    NegotiationTimeout(String),

    #[error("Dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Negotiation not found: {0}")]
    NegotiationNotFound(String),

    #[error("Offer not found: {0}")]
    OfferNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("Invalid state transition: {from} -> {to} ({context})")]
    InvalidStateTransition {
        from: String,
        to: String,
        context: String,
    },

    /// Returned by [`DispatchChannel`](crate::dispatch::DispatchChannel)
    /// implementations when a send fails.
    #[error("Dispatch failed to agent {agent_id}: {message}")]
    Dispatch { agent_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MeshError {
    /// Recoverable failures are retried by the coordination loops; the rest
    /// are surfaced to the caller immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoViableAgent { .. }
                | Self::AssignmentTimeout { .. }
                | Self::NegotiationTimeout(_)
                | Self::Dispatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
