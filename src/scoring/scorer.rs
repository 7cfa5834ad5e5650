//! Pure suitability scoring of one agent for one task.

use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;
use crate::directory::AgentInfo;
use crate::distribution::TaskRequest;

use super::classify::{KeywordClassifier, SpecializationClassifier};
use super::history::PerformanceTracker;

/// Score breakdown for one scheduling decision. Ephemeral: recomputed per
/// cycle so it always reflects the current load snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilityScore {
    pub agent_id: String,
    /// Weighted total in `[0, 1]`.
    pub score: f64,
    pub capability_match: f64,
    pub availability: f64,
    pub performance: f64,
    pub specialization: f64,
    pub load_factor: f64,
    /// Human-readable explanation of the decision.
    pub notes: Vec<String>,
}

/// Snapshot of one agent's active assignment burden.
#[derive(Debug, Clone, Default)]
pub struct AgentLoad {
    /// Complexity of each currently active assignment.
    pub active: Vec<f64>,
}

impl AgentLoad {
    pub fn load_factor(&self, config: &ScoringConfig) -> f64 {
        let base = self.active.len() as f64 * config.load_per_assignment;
        let complexity: f64 = self
            .active
            .iter()
            .map(|c| c * config.load_per_complexity)
            .sum();
        (base + complexity).min(1.0)
    }
}

/// Computes `score(agent, task)` from capability match, availability,
/// performance history, specialization and current load.
pub struct CapabilityScorer {
    config: ScoringConfig,
    classifier: Box<dyn SpecializationClassifier>,
}

impl CapabilityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            classifier: Box::new(KeywordClassifier),
        }
    }

    pub fn with_classifier(
        config: ScoringConfig,
        classifier: Box<dyn SpecializationClassifier>,
    ) -> Self {
        Self { config, classifier }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn score(
        &self,
        agent: &AgentInfo,
        task: &TaskRequest,
        load: &AgentLoad,
        history: &PerformanceTracker,
    ) -> AgentCapabilityScore {
        let mut notes = Vec::new();

        let capability_match = self.capability_match(agent, task, &mut notes);
        let availability = agent.status.availability_score();
        let published = agent.performance.tasks_completed + agent.performance.tasks_failed;
        let performance = match history.score(
            &agent.id,
            task.task_type(),
            self.config.target_completion_ms,
        ) {
            Some(p) => p,
            // Locally observed outcomes win; the directory's published
            // summary is the fallback before the flat default.
            None if published > 0 => {
                notes.push("no local history, using published success rate".to_string());
                agent.performance.success_rate()
            }
            None => {
                notes.push("no matching history, default performance".to_string());
                self.config.default_performance
            }
        };
        let specialization = self.specialization(agent, task, &mut notes);
        let load_factor = load.load_factor(&self.config);

        let score = capability_match * self.config.capability_weight
            + availability * self.config.availability_weight
            + performance * self.config.performance_weight
            + specialization * self.config.specialization_weight
            + (1.0 - load_factor) * self.config.load_weight;

        AgentCapabilityScore {
            agent_id: agent.id.clone(),
            score: score.clamp(0.0, 1.0),
            capability_match,
            availability,
            performance,
            specialization,
            load_factor,
            notes,
        }
    }

    /// An agent is a candidate only above the viability threshold. Zero
    /// availability (Offline) excludes the agent outright, whatever the
    /// weighted total.
    pub fn is_viable(&self, score: &AgentCapabilityScore) -> bool {
        score.availability > 0.0 && score.score > self.config.viability_threshold
    }

    fn capability_match(
        &self,
        agent: &AgentInfo,
        task: &TaskRequest,
        notes: &mut Vec<String>,
    ) -> f64 {
        if task.required_capabilities.is_empty() {
            notes.push("no required capabilities, neutral match".to_string());
            return self.config.neutral_capability_score;
        }

        let mut exact = 0usize;
        let mut partial = 0usize;
        for required in &task.required_capabilities {
            if agent.capabilities.iter().any(|c| c == required) {
                exact += 1;
            } else if agent
                .capabilities
                .iter()
                .any(|c| c.contains(required.as_str()) || required.contains(c.as_str()))
            {
                partial += 1;
            }
        }

        let total = task.required_capabilities.len() as f64;
        if exact == 0 && partial == 0 {
            notes.push("no capability overlap".to_string());
        } else if partial > 0 {
            notes.push(format!("{exact} exact, {partial} partial capability matches"));
        }
        ((exact as f64 + 0.5 * partial as f64) / total).min(1.0)
    }

    fn specialization(
        &self,
        agent: &AgentInfo,
        task: &TaskRequest,
        notes: &mut Vec<String>,
    ) -> f64 {
        let task_text = format!(
            "{} {}",
            task.name,
            task.required_capabilities
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(" ")
        );
        let task_category = self.classifier.classify(&task_text);
        let agent_category = self.classifier.classify(&agent.capabilities.join(" "));

        if task_category == agent_category {
            notes.push(format!("specialization match: {task_category:?}"));
            1.0
        } else if self.classifier.related(task_category, agent_category) {
            notes.push(format!(
                "related specialization: {task_category:?} ~ {agent_category:?}"
            ));
            0.7
        } else {
            0.5
        }
    }
}
