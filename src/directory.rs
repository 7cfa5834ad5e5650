//! Read-only view of the external agent pool.
//!
//! The core never owns agent lifecycle: agents register, go busy, and drop
//! offline in an external service, and the coordination loops only observe
//! snapshots through [`AgentDirectory`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Reported availability of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentStatus {
    /// Availability component used by the capability scorer.
    pub fn availability_score(&self) -> f64 {
        match self {
            Self::Idle => 1.0,
            Self::Busy => 0.3,
            Self::Error => 0.1,
            Self::Offline => 0.0,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Rolling performance summary the external pool publishes per agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_completion_ms: u64,
    /// Average time the agent takes to answer negotiation offers.
    pub avg_response_ms: u64,
}

impl PerformanceSummary {
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            0.5
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }
}

/// Directory entry for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub performance: PerformanceSummary,
}

impl AgentInfo {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, status: AgentStatus) -> Self {
        Self {
            id: id.into(),
            capabilities,
            status,
            performance: PerformanceSummary::default(),
        }
    }
}

/// Narrow read interface to the external agent pool.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_agents(&self) -> Result<Vec<AgentInfo>>;

    async fn get_agent(&self, id: &str) -> Result<AgentInfo>;
}

/// In-process directory used in tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn upsert(&self, agent: AgentInfo) {
        self.agents.write().insert(agent.id.clone(), agent);
    }

    pub fn set_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let mut agents = self.agents.write();
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| MeshError::AgentNotFound(id.to_string()))?;
        agent.status = status;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        self.agents.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryDirectory {
    async fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        Ok(self.agents.read().values().cloned().collect())
    }

    async fn get_agent(&self, id: &str) -> Result<AgentInfo> {
        self.agents
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MeshError::AgentNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_and_list() {
        let dir = InMemoryDirectory::new();
        dir.upsert(AgentInfo::new(
            "agent-1",
            vec!["assess-data-quality".into()],
            AgentStatus::Idle,
        ));
        dir.upsert(AgentInfo::new("agent-2", vec![], AgentStatus::Busy));

        let agents = dir.list_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(dir.get_agent("agent-1").await.unwrap().id, "agent-1");
        assert!(dir.get_agent("agent-3").await.is_err());
    }

    #[test]
    fn availability_scores_follow_status() {
        assert_eq!(AgentStatus::Idle.availability_score(), 1.0);
        assert_eq!(AgentStatus::Busy.availability_score(), 0.3);
        assert_eq!(AgentStatus::Error.availability_score(), 0.1);
        assert_eq!(AgentStatus::Offline.availability_score(), 0.0);
    }

    #[test]
    fn success_rate_is_neutral_without_history() {
        assert_eq!(PerformanceSummary::default().success_rate(), 0.5);
    }
}
