//! Agent-to-task suitability scoring.

mod classify;
mod history;
mod scorer;

pub use classify::{KeywordClassifier, SpecializationCategory, SpecializationClassifier};
pub use history::{OutcomeSample, PerformanceTracker};
pub use scorer::{AgentCapabilityScore, AgentLoad, CapabilityScorer};
