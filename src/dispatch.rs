//! External collaborator seams: the dispatch channel and the best-effort
//! state mirror.
//!
//! Delivery is fire-and-forget from the core's perspective; completion comes
//! back through `TaskDistributor::report_completion`. Mirror failures are
//! logged and never fatal; the core must keep functioning in memory.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Outbound message to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_id: String,
    pub action: DispatchAction,
    pub parameters: Value,
}

impl TaskDispatch {
    pub fn new(task_id: impl Into<String>, action: DispatchAction, parameters: Value) -> Self {
        Self {
            task_id: task_id.into(),
            action,
            parameters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchAction {
    ExecuteTask,
    NegotiationRequest,
    NegotiationOffer,
    NegotiationResolution,
    AgreementBroadcast,
}

/// Fire-and-forget message send to an agent, e.g. over a message bus.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    async fn send(&self, agent_id: &str, dispatch: TaskDispatch) -> Result<()>;
}

/// Best-effort mirroring of coordination state for observability.
#[async_trait]
pub trait StateMirror: Send + Sync {
    async fn record(&self, kind: &str, payload: Value) -> Result<()>;
}

/// Mirror a record, downgrading any failure to a warning.
pub async fn mirror_record(mirror: &dyn StateMirror, kind: &str, payload: Value) {
    if let Err(e) = mirror.record(kind, payload).await {
        warn!(kind, error = %e, "state mirror write failed, continuing in memory");
    }
}

/// Mirror that drops everything. Default when no persistence is attached.
#[derive(Debug, Default)]
pub struct NullMirror;

#[async_trait]
impl StateMirror for NullMirror {
    async fn record(&self, _kind: &str, _payload: Value) -> Result<()> {
        Ok(())
    }
}

/// Channel that records sends in memory. Used by tests and demos.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, TaskDispatch)>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn sent(&self) -> Vec<(String, TaskDispatch)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, agent_id: &str) -> Vec<TaskDispatch> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, d)| d.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl DispatchChannel for RecordingChannel {
    async fn send(&self, agent_id: &str, dispatch: TaskDispatch) -> Result<()> {
        self.sent.lock().push((agent_id.to_string(), dispatch));
        Ok(())
    }
}
