//! Negotiation protocol records: requests, offers, conflicts and the
//! agreements produced when a negotiation completes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decompose::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationKind {
    Resource,
    Collaboration,
    Priority,
    Delegation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    Pending,
    Active,
    Completed,
    Failed,
    TimedOut,
}

impl NegotiationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Offer decisions are monotonic: once decided, an offer never returns to
/// `Pending` and never changes its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Countered,
}

impl OfferStatus {
    pub fn is_decided(&self) -> bool {
        *self != Self::Pending
    }
}

/// A targeted agent's verdict on an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum OfferResponse {
    Accept,
    Reject,
    /// Counter-proposal; when no text is given the original proposal is
    /// re-used with the conceded cost.
    Counter { proposal: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRequest {
    pub id: String,
    pub kind: NegotiationKind,
    pub initiator: String,
    pub participants: BTreeSet<String>,
    pub subject: String,
    pub proposal: String,
    pub constraints: Vec<String>,
    pub deadline: DateTime<Utc>,
    pub status: NegotiationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationOffer {
    pub id: String,
    pub negotiation_id: String,
    pub from: String,
    pub to: BTreeSet<String>,
    pub proposal: String,
    pub conditions: Vec<String>,
    pub benefits: Vec<String>,
    pub cost: f64,
    pub priority: Priority,
    pub status: OfferStatus,
    pub submitted_at: DateTime<Utc>,
    /// Set when the offer was rejected without an explicit response.
    pub note: Option<String>,
}

impl NegotiationOffer {
    pub fn new(
        negotiation_id: impl Into<String>,
        from: impl Into<String>,
        to: BTreeSet<String>,
        proposal: impl Into<String>,
        cost: f64,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            negotiation_id: negotiation_id.into(),
            from: from.into(),
            to,
            proposal: proposal.into(),
            conditions: Vec::new(),
            benefits: Vec::new(),
            cost,
            priority,
            status: OfferStatus::Pending,
            submitted_at: Utc::now(),
            note: None,
        }
    }

    pub fn with_terms(mut self, conditions: Vec<String>, benefits: Vec<String>) -> Self {
        self.conditions = conditions;
        self.benefits = benefits;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    /// Severity grows with the number of agents contending for a resource.
    pub fn from_party_count(count: usize) -> Self {
        match count {
            0 | 1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Negotiation,
    Priority,
    Scheduling,
    ResourceExpansion,
}

/// Contention over a shared resource, either detected by the background
/// scan or synthesized as the resolution record of a resource negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConflict {
    pub id: String,
    pub resource: String,
    pub conflicting_agents: BTreeSet<String>,
    pub severity: ConflictSeverity,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub resolution_method: Option<ResolutionMethod>,
}

impl ResourceConflict {
    pub fn detected(resource: impl Into<String>, conflicting_agents: BTreeSet<String>) -> Self {
        let severity = ConflictSeverity::from_party_count(conflicting_agents.len());
        Self {
            id: Uuid::new_v4().to_string(),
            resource: resource.into(),
            conflicting_agents,
            severity,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
            resolution_method: None,
        }
    }

    pub fn resolve(&mut self, resolution: impl Into<String>, method: ResolutionMethod) {
        self.resolved_at = Some(Utc::now());
        self.resolution = Some(resolution.into());
        self.resolution_method = Some(method);
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    Draft,
    Active,
    Completed,
    Terminated,
}

/// Produced exactly once per completed collaboration negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationAgreement {
    pub id: String,
    pub participants: BTreeSet<String>,
    pub objective: String,
    /// Role per agent: leader, planner, analyst, architect or contributor.
    pub roles: BTreeMap<String, String>,
    pub responsibilities: BTreeMap<String, Vec<String>>,
    pub status: AgreementStatus,
    pub created_at: DateTime<Utc>,
}

/// What a finished negotiation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NegotiationOutcome {
    Agreement(CollaborationAgreement),
    Resolution(ResourceConflict),
}

/// One slot of a round-robin time-sharing schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub agent_id: String,
    pub starts_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub priority: Priority,
}
