//! Background contention detection over the agent pool.
//!
//! Resource usage is inferred from the capabilities of busy agents; two or
//! more busy agents mapping to the same shared resource open a resource
//! negotiation with a short resolution budget.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::ConflictConfig;
use crate::directory::AgentDirectory;
use crate::negotiation::{NegotiationEngine, NegotiationKind, ResourceConflict};

/// Shared resources a capability can imply.
const DATABASE_RESOURCE: &str = "database_connection";
const ANALYSIS_RESOURCE: &str = "analysis_engine";
const REPORTING_RESOURCE: &str = "reporting_service";

pub struct ConflictDetector {
    config: ConflictConfig,
    directory: Arc<dyn AgentDirectory>,
    engine: Arc<NegotiationEngine>,
    /// Resource name to the negotiation currently resolving it.
    open: RwLock<HashMap<String, String>>,
    detected: RwLock<Vec<ResourceConflict>>,
}

impl ConflictDetector {
    pub fn new(
        config: ConflictConfig,
        directory: Arc<dyn AgentDirectory>,
        engine: Arc<NegotiationEngine>,
    ) -> Self {
        Self {
            config,
            directory,
            engine,
            open: RwLock::new(HashMap::new()),
            detected: RwLock::new(Vec::new()),
        }
    }

    /// One detection pass. Returns the number of negotiations opened.
    pub async fn run_conflict_scan(&self) -> usize {
        self.clear_settled();

        let agents = match self.directory.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "agent directory unavailable, skipping conflict scan");
                return 0;
            }
        };

        let mut usage: BTreeMap<&'static str, BTreeSet<String>> = BTreeMap::new();
        for agent in agents.iter().filter(|a| a.status.is_busy()) {
            for resource in inferred_resources(&agent.capabilities) {
                usage.entry(resource).or_default().insert(agent.id.clone());
            }
        }

        let mut opened = 0usize;
        for (resource, contenders) in usage {
            if contenders.len() < 2 {
                continue;
            }
            if self.open.read().contains_key(resource) {
                debug!(resource, "contention already under negotiation");
                continue;
            }

            let conflict = ResourceConflict::detected(resource, contenders.clone());
            info!(
                resource,
                agents = contenders.len(),
                severity = ?conflict.severity,
                "resource contention detected"
            );
            self.detected.write().push(conflict);

            let initiator = contenders
                .first()
                .cloned()
                .unwrap_or_else(|| "coordinator".into());
            let deadline =
                Utc::now() + chrono::Duration::seconds(self.config.resolution_budget_secs as i64);
            match self
                .engine
                .initiate(
                    NegotiationKind::Resource,
                    &initiator,
                    contenders,
                    resource,
                    "negotiate shared access to the contended resource",
                    vec![],
                    Some(deadline),
                )
                .await
            {
                Ok(request) => {
                    self.open.write().insert(resource.to_string(), request.id);
                    opened += 1;
                }
                Err(e) => {
                    warn!(resource, error = %e, "failed to open resource negotiation");
                }
            }
        }
        opened
    }

    /// Conflicts whose negotiation has settled may be re-detected later.
    fn clear_settled(&self) {
        let mut open = self.open.write();
        open.retain(|resource, negotiation_id| {
            match self.engine.negotiation(negotiation_id) {
                Some(request) if request.status.is_terminal() => {
                    debug!(resource, negotiation = %negotiation_id, "contention settled");
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }

    pub fn detected_conflicts(&self) -> Vec<ResourceConflict> {
        self.detected.read().clone()
    }

    pub fn open_negotiation_for(&self, resource: &str) -> Option<String> {
        self.open.read().get(resource).cloned()
    }
}

/// Each capability maps to at most one resource; database wins over
/// analysis so that "database" does not also match on its "data" prefix.
fn inferred_resources(capabilities: &[String]) -> BTreeSet<&'static str> {
    let mut resources = BTreeSet::new();
    for capability in capabilities {
        if capability.contains("database")
            || capability.contains("sql")
            || capability.contains("query")
        {
            resources.insert(DATABASE_RESOURCE);
        } else if capability.contains("analy") || capability.contains("data") {
            resources.insert(ANALYSIS_RESOURCE);
        } else if capability.contains("report") || capability.contains("document") {
            resources.insert(REPORTING_RESOURCE);
        }
    }
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NegotiationConfig;
    use crate::directory::{AgentInfo, AgentStatus, InMemoryDirectory};
    use crate::dispatch::{NullMirror, RecordingChannel};
    use crate::negotiation::{ConflictSeverity, NegotiationStatus, OfferResponse};

    fn harness() -> (ConflictDetector, Arc<InMemoryDirectory>, Arc<NegotiationEngine>) {
        let directory = InMemoryDirectory::shared();
        let channel = RecordingChannel::shared();
        let engine = NegotiationEngine::new(
            NegotiationConfig::default(),
            directory.clone(),
            channel,
            Arc::new(NullMirror),
        );
        let detector = ConflictDetector::new(
            ConflictConfig::default(),
            directory.clone(),
            engine.clone(),
        );
        (detector, directory, engine)
    }

    fn busy(id: &str, capabilities: &[&str]) -> AgentInfo {
        AgentInfo::new(
            id,
            capabilities.iter().map(|s| s.to_string()).collect(),
            AgentStatus::Busy,
        )
    }

    #[test]
    fn capabilities_map_to_shared_resources() {
        let capabilities = vec!["query-database".to_string(), "draft-report".to_string()];
        let resources = inferred_resources(&capabilities);
        assert!(resources.contains(DATABASE_RESOURCE));
        assert!(resources.contains(REPORTING_RESOURCE));
        assert!(!resources.contains(ANALYSIS_RESOURCE));
    }

    #[tokio::test]
    async fn two_busy_agents_on_one_resource_open_a_negotiation() {
        let (detector, directory, engine) = harness();
        directory.upsert(busy("agent-1", &["query-database"]));
        directory.upsert(busy("agent-2", &["tune-database-indexes"]));
        // Idle agents never contend.
        directory.upsert(AgentInfo::new(
            "agent-3",
            vec!["query-database".into()],
            AgentStatus::Idle,
        ));

        assert_eq!(detector.run_conflict_scan().await, 1);

        let negotiation_id = detector.open_negotiation_for(DATABASE_RESOURCE).unwrap();
        let request = engine.negotiation(&negotiation_id).unwrap();
        assert_eq!(request.kind, NegotiationKind::Resource);
        assert_eq!(request.subject, DATABASE_RESOURCE);
        assert_eq!(request.participants.len(), 2);
        // Two-minute resolution budget.
        let budget = request.deadline - request.created_at;
        assert!(budget <= chrono::Duration::seconds(121));
        assert!(budget >= chrono::Duration::seconds(119));

        let conflicts = detector.detected_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Medium);
    }

    #[tokio::test]
    async fn repeated_scans_do_not_duplicate_negotiations() {
        let (detector, directory, _engine) = harness();
        directory.upsert(busy("agent-1", &["query-database"]));
        directory.upsert(busy("agent-2", &["query-database"]));

        assert_eq!(detector.run_conflict_scan().await, 1);
        assert_eq!(detector.run_conflict_scan().await, 0);
    }

    #[tokio::test]
    async fn settled_contention_can_be_redetected() {
        let (detector, directory, engine) = harness();
        directory.upsert(busy("agent-1", &["query-database"]));
        directory.upsert(busy("agent-2", &["query-database"]));
        detector.run_conflict_scan().await;

        let negotiation_id = detector.open_negotiation_for(DATABASE_RESOURCE).unwrap();
        let offer = engine
            .submit_offer(
                &negotiation_id,
                crate::negotiation::NegotiationOffer::new(
                    &negotiation_id,
                    "agent-1",
                    ["agent-2".to_string()].into(),
                    "agent-1 takes the next slot",
                    1.0,
                    crate::decompose::Priority::Medium,
                ),
            )
            .await
            .unwrap();
        engine
            .respond(&offer.id, "agent-2", OfferResponse::Accept)
            .await
            .unwrap();
        assert_eq!(
            engine.negotiation(&negotiation_id).unwrap().status,
            NegotiationStatus::Completed
        );

        // The agents are still busy, so the next scan reopens contention.
        assert_eq!(detector.run_conflict_scan().await, 1);
        let reopened = detector.open_negotiation_for(DATABASE_RESOURCE).unwrap();
        assert_ne!(reopened, negotiation_id);
    }

    #[tokio::test]
    async fn single_busy_agent_is_not_a_conflict() {
        let (detector, directory, _engine) = harness();
        directory.upsert(busy("agent-1", &["query-database"]));
        assert_eq!(detector.run_conflict_scan().await, 0);
    }
}
