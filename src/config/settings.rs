use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{MeshError, Result};

/// Top-level configuration for the coordination core.
///
/// Every hand-tuned constant in the scheduler and negotiation protocol is a
/// field here rather than a hard invariant: the values are heuristic, not
/// provable, and operators are expected to retune them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub scoring: ScoringConfig,
    pub distribution: DistributionConfig,
    pub negotiation: NegotiationConfig,
    pub conflict: ConflictConfig,
    pub decomposition: DecompositionConfig,
}

impl MeshConfig {
    pub async fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self).map_err(|e| MeshError::Config(e.to_string()))?;
        fs::write(dir.join("config.toml"), content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let weight_sum = self.scoring.capability_weight
            + self.scoring.availability_weight
            + self.scoring.performance_weight
            + self.scoring.specialization_weight
            + self.scoring.load_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            errors.push("scoring weights must sum to 1.0");
        }
        if !(0.0..=1.0).contains(&self.scoring.viability_threshold) {
            errors.push("scoring.viability_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.scoring.neutral_capability_score) {
            errors.push("scoring.neutral_capability_score must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.scoring.default_performance) {
            errors.push("scoring.default_performance must be between 0.0 and 1.0");
        }
        if self.scoring.history_window == 0 {
            errors.push("scoring.history_window must be greater than 0");
        }
        if self.scoring.target_completion_ms == 0 {
            errors.push("scoring.target_completion_ms must be greater than 0");
        }

        if self.distribution.cycle_interval_ms == 0 {
            errors.push("distribution.cycle_interval_ms must be greater than 0");
        }
        if self.distribution.assignment_timeout_ms == 0 {
            errors.push("distribution.assignment_timeout_ms must be greater than 0");
        }
        if self.distribution.candidate_pool_size == 0 {
            errors.push("distribution.candidate_pool_size must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.distribution.tie_break_window) {
            errors.push("distribution.tie_break_window must be between 0.0 and 1.0");
        }
        if self.distribution.underload_threshold >= self.distribution.overload_threshold {
            errors.push("distribution.underload_threshold must be less than overload_threshold");
        }
        if !(0.0..=1.0).contains(&self.distribution.rebalance_min_score) {
            errors.push("distribution.rebalance_min_score must be between 0.0 and 1.0");
        }

        if self.negotiation.default_deadline_secs == 0 {
            errors.push("negotiation.default_deadline_secs must be greater than 0");
        }
        if self.negotiation.offer_response_timeout_ms == 0 {
            errors.push("negotiation.offer_response_timeout_ms must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.negotiation.concession_rate) {
            errors.push("negotiation.concession_rate must be between 0.0 and 1.0");
        }
        if self.negotiation.time_slot_minutes == 0 {
            errors.push("negotiation.time_slot_minutes must be greater than 0");
        }

        if self.conflict.scan_interval_ms == 0 {
            errors.push("conflict.scan_interval_ms must be greater than 0");
        }
        if self.conflict.resolution_budget_secs == 0 {
            errors.push("conflict.resolution_budget_secs must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Config(errors.join("; ")))
        }
    }
}

/// Weights and thresholds for the capability scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub capability_weight: f64,
    pub availability_weight: f64,
    pub performance_weight: f64,
    pub specialization_weight: f64,
    pub load_weight: f64,
    /// Agents scoring at or below this are excluded from candidacy.
    pub viability_threshold: f64,
    /// Capability-match score for tasks that declare no required capabilities.
    pub neutral_capability_score: f64,
    /// Performance score for agents with no recorded history.
    pub default_performance: f64,
    /// Completion time treated as full speed when normalizing performance.
    pub target_completion_ms: u64,
    /// Rolling window of outcome samples kept per agent (FIFO eviction).
    pub history_window: usize,
    /// Load contributed by each active assignment.
    pub load_per_assignment: f64,
    /// Additional load contributed per unit of task complexity.
    pub load_per_complexity: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            capability_weight: 0.35,
            availability_weight: 0.25,
            performance_weight: 0.20,
            specialization_weight: 0.15,
            load_weight: 0.05,
            viability_threshold: 0.3,
            neutral_capability_score: 0.6,
            default_performance: 0.8,
            target_completion_ms: 15_000,
            history_window: 50,
            load_per_assignment: 0.3,
            load_per_complexity: 0.2,
        }
    }
}

/// Timing and balancing knobs for the task distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Interval between distribution cycles.
    pub cycle_interval_ms: u64,
    /// Deadline for an agent to report completion after dispatch.
    pub assignment_timeout_ms: u64,
    /// Reassignment attempts before a task is terminally failed.
    pub max_retries: u32,
    /// Candidates considered for tie-breaking (top-N by score).
    pub candidate_pool_size: usize,
    /// Fraction of the top score within which candidates tie-break on load.
    pub tie_break_window: f64,
    /// Minutes before a deadline at which a task gets a priority bump.
    pub deadline_soon_mins: i64,
    /// Interval between rebalancing cycles.
    pub rebalance_interval_ms: u64,
    /// Load factor above which an agent is considered overloaded.
    pub overload_threshold: f64,
    /// Load factor below which an agent is considered underloaded.
    pub underload_threshold: f64,
    /// Minimum score an underloaded agent needs to receive a moved task.
    pub rebalance_min_score: f64,
    /// Consecutive cycles a task may go without candidates before a warning.
    pub barren_cycle_warning: u32,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 3_000,
            assignment_timeout_ms: 60_000,
            max_retries: 3,
            candidate_pool_size: 3,
            tie_break_window: 0.10,
            deadline_soon_mins: 5,
            rebalance_interval_ms: 10_000,
            overload_threshold: 0.8,
            underload_threshold: 0.3,
            rebalance_min_score: 0.5,
            barren_cycle_warning: 5,
        }
    }
}

/// Protocol timing for the negotiation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Default negotiation deadline when the initiator does not set one.
    pub default_deadline_secs: u64,
    /// Per-offer response window; silence is treated as a reject.
    pub offer_response_timeout_ms: u64,
    /// Interval between deadline sweeps over active negotiations.
    pub sweep_interval_ms: u64,
    /// Cost reduction applied to each counter-offer.
    pub concession_rate: f64,
    /// Slot length for round-robin time-sharing fallback schedules.
    pub time_slot_minutes: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            default_deadline_secs: 300,
            offer_response_timeout_ms: 60_000,
            sweep_interval_ms: 5_000,
            concession_rate: 0.10,
            time_slot_minutes: 30,
        }
    }
}

/// Background resource-conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Interval between conflict-detection scans of the agent pool.
    pub scan_interval_ms: u64,
    /// Deadline budget for auto-initiated resource negotiations.
    pub resolution_budget_secs: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 15_000,
            resolution_budget_secs: 120,
        }
    }
}

/// Objective decomposition behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    /// Duration multiplier for objectives classified as simple.
    pub simple_duration_factor: f64,
    /// Duration multiplier for objectives classified as complex.
    pub complex_duration_factor: f64,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            simple_duration_factor: 0.5,
            complex_duration_factor: 1.5,
        }
    }
}
