//! Specialization taxonomy over task and agent descriptions.
//!
//! Classification is an explicit, swappable strategy: the default keyword
//! matcher can be replaced with a real taxonomy later without touching the
//! scheduler.

use serde::{Deserialize, Serialize};

/// Fixed specialization taxonomy shared by tasks and agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecializationCategory {
    Workshop,
    Data,
    Database,
    Reporting,
    General,
}

/// Strategy mapping free-text names/capabilities into the taxonomy.
pub trait SpecializationClassifier: Send + Sync {
    fn classify(&self, text: &str) -> SpecializationCategory;

    /// Whether two distinct categories are close enough to count as a
    /// partial specialization match.
    fn related(&self, a: SpecializationCategory, b: SpecializationCategory) -> bool;
}

/// Default substring-based classifier.
#[derive(Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    // Database keywords are checked before data keywords so that
    // "query-database" does not classify as Data via the shared substring.
    const WORKSHOP: &'static [&'static str] =
        &["workshop", "governance", "facilitat", "agenda", "session"];
    const DATABASE: &'static [&'static str] = &["database", "sql", "schema", "query"];
    const DATA: &'static [&'static str] = &["data", "analy", "quality", "metric"];
    const REPORTING: &'static [&'static str] = &["report", "document", "summar", "draft"];
}

impl SpecializationClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> SpecializationCategory {
        let lower = text.to_lowercase();
        let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if contains_any(Self::WORKSHOP) {
            SpecializationCategory::Workshop
        } else if contains_any(Self::DATABASE) {
            SpecializationCategory::Database
        } else if contains_any(Self::DATA) {
            SpecializationCategory::Data
        } else if contains_any(Self::REPORTING) {
            SpecializationCategory::Reporting
        } else {
            SpecializationCategory::General
        }
    }

    fn related(&self, a: SpecializationCategory, b: SpecializationCategory) -> bool {
        use SpecializationCategory::*;
        matches!((a, b), (Data, Database) | (Database, Data) | (Data, Reporting) | (Reporting, Data))
    }
}
