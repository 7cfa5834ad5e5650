//! Rolling per-agent outcome history feeding the performance component of
//! the scorer.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One task outcome for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub success: bool,
    pub completion_ms: u64,
    pub task_type: String,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeSample {
    pub fn new(success: bool, completion_ms: u64, task_type: impl Into<String>) -> Self {
        Self {
            success,
            completion_ms,
            task_type: task_type.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// FIFO window of outcome samples per agent.
#[derive(Debug)]
pub struct PerformanceTracker {
    window: usize,
    samples: RwLock<HashMap<String, VecDeque<OutcomeSample>>>,
}

impl PerformanceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, agent_id: &str, sample: OutcomeSample) {
        let mut map = self.samples.write();
        let window = map.entry(agent_id.to_string()).or_default();
        window.push_back(sample);
        while window.len() > self.window {
            window.pop_front();
        }
    }

    /// Performance score for an agent on a task type, or `None` when the
    /// agent has no matching history. Success rate weighs 0.7, normalized
    /// speed against `target_ms` weighs 0.3.
    pub fn score(&self, agent_id: &str, task_type: &str, target_ms: u64) -> Option<f64> {
        let map = self.samples.read();
        let window = map.get(agent_id)?;
        let matching: Vec<&OutcomeSample> = window
            .iter()
            .filter(|s| s.task_type == task_type)
            .collect();
        if matching.is_empty() {
            return None;
        }

        let successes = matching.iter().filter(|s| s.success).count();
        let success_rate = successes as f64 / matching.len() as f64;
        let avg_ms =
            matching.iter().map(|s| s.completion_ms).sum::<u64>() as f64 / matching.len() as f64;
        let speed = if avg_ms <= 0.0 {
            1.0
        } else {
            (target_ms as f64 / avg_ms).clamp(0.0, 1.0)
        };

        Some(success_rate * 0.7 + speed * 0.3)
    }

    pub fn sample_count(&self, agent_id: &str) -> usize {
        self.samples.read().get(agent_id).map_or(0, VecDeque::len)
    }

    pub fn samples_for(&self, agent_id: &str) -> Vec<OutcomeSample> {
        self.samples
            .read()
            .get(agent_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }
}
