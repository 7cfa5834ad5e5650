//! Structured negotiation between agents: offers, counter-offers,
//! deadline-driven automatic resolution and background conflict detection.

mod conflict;
mod engine;
mod types;

pub use conflict::ConflictDetector;
pub use engine::NegotiationEngine;
pub use types::{
    AgreementStatus, CollaborationAgreement, ConflictSeverity, NegotiationKind,
    NegotiationOffer, NegotiationOutcome, NegotiationRequest, NegotiationStatus, OfferResponse,
    OfferStatus, ResolutionMethod, ResourceConflict, ScheduleSlot,
};
