//! Offer/response negotiation protocol with deadline sweeps and automatic
//! resolution fallbacks for negotiations that run out of time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NegotiationConfig;
use crate::decompose::Priority;
use crate::directory::AgentDirectory;
use crate::dispatch::{
    DispatchAction, DispatchChannel, StateMirror, TaskDispatch, mirror_record,
};
use crate::error::{MeshError, Result};
use crate::timer::TimerRegistry;

use super::types::{
    AgreementStatus, CollaborationAgreement, NegotiationKind, NegotiationOffer,
    NegotiationOutcome, NegotiationRequest, NegotiationStatus, OfferResponse, OfferStatus,
    ResolutionMethod, ResourceConflict, ScheduleSlot,
};

struct NegotiationRecord {
    request: NegotiationRequest,
    offers: Vec<NegotiationOffer>,
    outcome: Option<NegotiationOutcome>,
}

/// What `respond` decided while the negotiation lock was held; the
/// follow-up work (broadcasts, finalization) runs after release.
enum ResponseStep {
    AlreadyFinal,
    Finalize,
    Counter(NegotiationOffer),
    NegotiationFailed,
    Recorded,
}

pub struct NegotiationEngine {
    config: NegotiationConfig,
    directory: Arc<dyn AgentDirectory>,
    channel: Arc<dyn DispatchChannel>,
    mirror: Arc<dyn StateMirror>,
    negotiations: RwLock<HashMap<String, NegotiationRecord>>,
    offer_index: RwLock<HashMap<String, String>>,
    /// Observed offer response times per agent, for leader selection and
    /// priority ranking.
    response_times: RwLock<HashMap<String, (u64, u64)>>,
    timers: TimerRegistry,
}

impl NegotiationEngine {
    pub fn new(
        config: NegotiationConfig,
        directory: Arc<dyn AgentDirectory>,
        channel: Arc<dyn DispatchChannel>,
        mirror: Arc<dyn StateMirror>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            channel,
            mirror,
            negotiations: RwLock::new(HashMap::new()),
            offer_index: RwLock::new(HashMap::new()),
            response_times: RwLock::new(HashMap::new()),
            timers: TimerRegistry::new(),
        })
    }

    /// Open a negotiation and broadcast it to every participant.
    #[allow(clippy::too_many_arguments)]
    pub async fn initiate(
        self: &Arc<Self>,
        kind: NegotiationKind,
        initiator: &str,
        participants: BTreeSet<String>,
        subject: &str,
        proposal: &str,
        constraints: Vec<String>,
        deadline: Option<chrono::DateTime<Utc>>,
    ) -> Result<NegotiationRequest> {
        if participants.is_empty() {
            return Err(MeshError::Other(
                "negotiation requires at least one participant".into(),
            ));
        }
        let now = Utc::now();
        let mut request = NegotiationRequest {
            id: Uuid::new_v4().to_string(),
            kind,
            initiator: initiator.to_string(),
            participants,
            subject: subject.to_string(),
            proposal: proposal.to_string(),
            constraints,
            deadline: deadline
                .unwrap_or_else(|| now + chrono::Duration::seconds(self.config.default_deadline_secs as i64)),
            status: NegotiationStatus::Pending,
            created_at: now,
        };
        self.negotiations.write().insert(
            request.id.clone(),
            NegotiationRecord {
                request: request.clone(),
                offers: Vec::new(),
                outcome: None,
            },
        );
        info!(
            negotiation = %request.id,
            kind = ?kind,
            subject,
            participants = request.participants.len(),
            "negotiation initiated"
        );

        let payload = json!({
            "negotiation_id": request.id,
            "kind": request.kind,
            "initiator": request.initiator,
            "subject": request.subject,
            "proposal": request.proposal,
            "deadline": request.deadline,
        });
        for participant in &request.participants {
            let message = TaskDispatch::new(
                &request.id,
                DispatchAction::NegotiationRequest,
                payload.clone(),
            );
            if let Err(e) = self.channel.send(participant, message).await {
                warn!(negotiation = %request.id, agent = %participant, error = %e, "negotiation broadcast failed");
            }
        }

        // Pending only for the opening broadcast; activation arms the
        // deadline timer.
        request.status = NegotiationStatus::Active;
        if let Some(record) = self.negotiations.write().get_mut(&request.id) {
            record.request.status = NegotiationStatus::Active;
        }
        self.arm_deadline_timer(&request.id, request.deadline);

        mirror_record(
            self.mirror.as_ref(),
            "negotiation",
            serde_json::to_value(&request).unwrap_or_default(),
        )
        .await;
        Ok(request)
    }

    /// Submit an offer into an active negotiation; targets get 60s (by
    /// config) to respond before silence counts as a timeout reject.
    pub async fn submit_offer(
        self: &Arc<Self>,
        negotiation_id: &str,
        offer: NegotiationOffer,
    ) -> Result<NegotiationOffer> {
        let offer = {
            let mut negotiations = self.negotiations.write();
            let record = negotiations
                .get_mut(negotiation_id)
                .ok_or_else(|| MeshError::NegotiationNotFound(negotiation_id.to_string()))?;
            if record.request.status != NegotiationStatus::Active {
                return Err(MeshError::InvalidStateTransition {
                    from: format!("{:?}", record.request.status),
                    to: "offer submission".into(),
                    context: format!("negotiation {negotiation_id}"),
                });
            }
            let mut offer = offer;
            offer.negotiation_id = negotiation_id.to_string();
            record.offers.push(offer.clone());
            offer
        };
        self.offer_index
            .write()
            .insert(offer.id.clone(), negotiation_id.to_string());
        self.arm_offer_timer(&offer.id);
        self.broadcast_offer(&offer).await;
        debug!(negotiation = negotiation_id, offer = %offer.id, from = %offer.from, "offer submitted");
        Ok(offer)
    }

    /// A targeted agent's response to an offer. Offer decisions are
    /// monotonic; an `accept` on an already-completed negotiation is the
    /// one permitted duplicate and is a no-op.
    pub async fn respond(
        self: &Arc<Self>,
        offer_id: &str,
        responder: &str,
        response: OfferResponse,
    ) -> Result<()> {
        let negotiation_id = self
            .offer_index
            .read()
            .get(offer_id)
            .cloned()
            .ok_or_else(|| MeshError::OfferNotFound(offer_id.to_string()))?;

        let mut elapsed_ms = None;
        let step = {
            let mut negotiations = self.negotiations.write();
            let record = negotiations
                .get_mut(&negotiation_id)
                .ok_or_else(|| MeshError::NegotiationNotFound(negotiation_id.clone()))?;
            let index = record
                .offers
                .iter()
                .position(|o| o.id == offer_id)
                .ok_or_else(|| MeshError::OfferNotFound(offer_id.to_string()))?;

            if record.offers[index].status.is_decided() {
                if matches!(response, OfferResponse::Accept)
                    && record.request.status == NegotiationStatus::Completed
                {
                    ResponseStep::AlreadyFinal
                } else {
                    return Err(MeshError::InvalidStateTransition {
                        from: format!("{:?}", record.offers[index].status),
                        to: format!("{response:?}"),
                        context: format!("offer {offer_id}"),
                    });
                }
            } else {
                elapsed_ms = Some(
                    (Utc::now() - record.offers[index].submitted_at)
                        .num_milliseconds()
                        .max(0) as u64,
                );
                match response {
                    OfferResponse::Accept => {
                        record.offers[index].status = OfferStatus::Accepted;
                        if record.request.status == NegotiationStatus::Active {
                            record.request.status = NegotiationStatus::Completed;
                            ResponseStep::Finalize
                        } else {
                            ResponseStep::AlreadyFinal
                        }
                    }
                    OfferResponse::Reject => {
                        record.offers[index].status = OfferStatus::Rejected;
                        let all_rejected = record
                            .offers
                            .iter()
                            .all(|o| o.status == OfferStatus::Rejected);
                        if all_rejected && record.request.status == NegotiationStatus::Active {
                            record.request.status = NegotiationStatus::Failed;
                            ResponseStep::NegotiationFailed
                        } else {
                            ResponseStep::Recorded
                        }
                    }
                    OfferResponse::Counter { proposal } => {
                        record.offers[index].status = OfferStatus::Countered;
                        let original = record.offers[index].clone();
                        let counter = NegotiationOffer::new(
                            negotiation_id.clone(),
                            responder,
                            BTreeSet::from([original.from.clone()]),
                            proposal.unwrap_or_else(|| original.proposal.clone()),
                            original.cost * (1.0 - self.config.concession_rate),
                            original.priority,
                        )
                        .with_terms(original.conditions.clone(), original.benefits.clone());
                        record.offers.push(counter.clone());
                        ResponseStep::Counter(counter)
                    }
                }
            }
        };

        self.timers.cancel(&offer_timer_key(offer_id));
        if let Some(elapsed) = elapsed_ms {
            self.record_response_time(responder, elapsed);
        }

        match step {
            ResponseStep::AlreadyFinal => {
                debug!(offer = offer_id, "duplicate accept on settled negotiation ignored");
                Ok(())
            }
            ResponseStep::Finalize => {
                self.timers.cancel(&negotiation_timer_key(&negotiation_id));
                self.finalize(&negotiation_id).await
            }
            ResponseStep::Counter(counter) => {
                self.offer_index
                    .write()
                    .insert(counter.id.clone(), negotiation_id.clone());
                self.arm_offer_timer(&counter.id);
                self.broadcast_offer(&counter).await;
                info!(
                    negotiation = %negotiation_id,
                    offer = %counter.id,
                    cost = counter.cost,
                    "counter-offer issued"
                );
                Ok(())
            }
            ResponseStep::NegotiationFailed => {
                self.timers.cancel(&negotiation_timer_key(&negotiation_id));
                warn!(negotiation = %negotiation_id, "all offers rejected, negotiation failed");
                self.mirror_negotiation(&negotiation_id).await;
                Ok(())
            }
            ResponseStep::Recorded => Ok(()),
        }
    }

    /// Wall-clock backstop over active negotiations whose deadline timer
    /// never fired (for example negotiations initiated with a deadline
    /// already in the past). Returns expired count.
    pub async fn run_timeout_sweep(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let overdue: Vec<String> = self
            .negotiations
            .read()
            .values()
            .filter(|r| r.request.status == NegotiationStatus::Active && r.request.deadline < now)
            .map(|r| r.request.id.clone())
            .collect();

        let mut expired = 0usize;
        for id in &overdue {
            if self.expire(id).await {
                expired += 1;
            }
        }
        expired
    }

    pub fn negotiation(&self, id: &str) -> Option<NegotiationRequest> {
        self.negotiations.read().get(id).map(|r| r.request.clone())
    }

    pub fn offers(&self, negotiation_id: &str) -> Vec<NegotiationOffer> {
        self.negotiations
            .read()
            .get(negotiation_id)
            .map(|r| r.offers.clone())
            .unwrap_or_default()
    }

    pub fn outcome(&self, negotiation_id: &str) -> Option<NegotiationOutcome> {
        self.negotiations
            .read()
            .get(negotiation_id)
            .and_then(|r| r.outcome.clone())
    }

    pub fn active_negotiations(&self) -> Vec<NegotiationRequest> {
        self.negotiations
            .read()
            .values()
            .filter(|r| r.request.status == NegotiationStatus::Active)
            .map(|r| r.request.clone())
            .collect()
    }

    pub fn shutdown_timers(&self) {
        self.timers.cancel_all();
    }

    // Internal machinery.

    /// Take an active negotiation past its deadline: an accepted offer
    /// finalizes it, anything else times out and gets the automatic
    /// resolution for its kind. Runs from the deadline timer and from the
    /// sweep; whichever claims the `Active` status first wins, the other
    /// is a no-op.
    async fn expire(self: &Arc<Self>, negotiation_id: &str) -> bool {
        let accepted = {
            let mut negotiations = self.negotiations.write();
            let Some(record) = negotiations.get_mut(negotiation_id) else {
                return false;
            };
            if record.request.status != NegotiationStatus::Active {
                return false;
            }
            let accepted = record
                .offers
                .iter()
                .any(|o| o.status == OfferStatus::Accepted);
            record.request.status = if accepted {
                NegotiationStatus::Completed
            } else {
                NegotiationStatus::TimedOut
            };
            for offer in &record.offers {
                self.timers.cancel(&offer_timer_key(&offer.id));
            }
            accepted
        };
        self.timers.cancel(&negotiation_timer_key(negotiation_id));

        if accepted {
            if let Err(e) = self.finalize(negotiation_id).await {
                warn!(negotiation = negotiation_id, error = %e, "finalize on expiry failed");
            }
        } else {
            warn!(
                negotiation = negotiation_id,
                "negotiation deadline exceeded, applying automatic resolution"
            );
            self.auto_resolve(negotiation_id).await;
        }
        true
    }

    /// Deadline expiry rides the runtime clock like the offer timers do; a
    /// deadline already in the past is left for the sweep.
    fn arm_deadline_timer(self: &Arc<Self>, negotiation_id: &str, deadline: chrono::DateTime<Utc>) {
        let after = (deadline - Utc::now()).num_milliseconds();
        if after <= 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        let id = negotiation_id.to_string();
        self.timers.arm(
            &negotiation_timer_key(negotiation_id),
            Duration::from_millis(after as u64),
            move || async move {
                if let Some(engine) = weak.upgrade() {
                    engine.expire(&id).await;
                }
            },
        );
    }

    fn arm_offer_timer(self: &Arc<Self>, offer_id: &str) {
        let weak = Arc::downgrade(self);
        let offer_id_owned = offer_id.to_string();
        self.timers.arm(
            &offer_timer_key(offer_id),
            Duration::from_millis(self.config.offer_response_timeout_ms),
            move || async move {
                if let Some(engine) = weak.upgrade() {
                    engine.handle_offer_timeout(&offer_id_owned);
                }
            },
        );
    }

    /// No response inside the window counts as a reject with a timeout
    /// note; a decided offer is left untouched.
    fn handle_offer_timeout(&self, offer_id: &str) {
        let Some(negotiation_id) = self.offer_index.read().get(offer_id).cloned() else {
            return;
        };
        let mut negotiations = self.negotiations.write();
        let Some(record) = negotiations.get_mut(&negotiation_id) else {
            return;
        };
        let Some(offer) = record
            .offers
            .iter_mut()
            .find(|o| o.id == offer_id && o.status == OfferStatus::Pending)
        else {
            return;
        };
        offer.status = OfferStatus::Rejected;
        offer.note = Some("timeout".into());
        warn!(negotiation = %negotiation_id, offer = offer_id, "offer response window elapsed");

        if record.request.status == NegotiationStatus::Active
            && record
                .offers
                .iter()
                .all(|o| o.status == OfferStatus::Rejected)
        {
            record.request.status = NegotiationStatus::Failed;
            self.timers.cancel(&negotiation_timer_key(&negotiation_id));
            warn!(negotiation = %negotiation_id, "all offers rejected, negotiation failed");
        }
    }

    async fn broadcast_offer(&self, offer: &NegotiationOffer) {
        let payload = serde_json::to_value(offer).unwrap_or_default();
        for target in &offer.to {
            let message = TaskDispatch::new(
                &offer.negotiation_id,
                DispatchAction::NegotiationOffer,
                payload.clone(),
            );
            if let Err(e) = self.channel.send(target, message).await {
                warn!(offer = %offer.id, agent = %target, error = %e, "offer broadcast failed");
            }
        }
    }

    /// Build and store the settlement of a completed negotiation. The
    /// status transition to `Completed` is the idempotency claim, so this
    /// runs at most once per negotiation.
    async fn finalize(self: &Arc<Self>, negotiation_id: &str) -> Result<()> {
        let (request, accepted_proposal) = {
            let negotiations = self.negotiations.read();
            let record = negotiations
                .get(negotiation_id)
                .ok_or_else(|| MeshError::NegotiationNotFound(negotiation_id.to_string()))?;
            if record.outcome.is_some() {
                return Ok(());
            }
            let proposal = record
                .offers
                .iter()
                .find(|o| o.status == OfferStatus::Accepted)
                .map(|o| o.proposal.clone());
            (record.request.clone(), proposal)
        };
        for offer in self.offers(negotiation_id) {
            self.timers.cancel(&offer_timer_key(&offer.id));
        }

        let outcome = match request.kind {
            NegotiationKind::Collaboration | NegotiationKind::Delegation => {
                NegotiationOutcome::Agreement(self.build_agreement(&request).await)
            }
            NegotiationKind::Resource | NegotiationKind::Priority => {
                let mut conflict = ResourceConflict::detected(
                    request.subject.clone(),
                    request.participants.clone(),
                );
                conflict.resolve(
                    accepted_proposal.unwrap_or_else(|| request.proposal.clone()),
                    ResolutionMethod::Negotiation,
                );
                NegotiationOutcome::Resolution(conflict)
            }
        };
        {
            let mut negotiations = self.negotiations.write();
            if let Some(record) = negotiations.get_mut(negotiation_id) {
                if record.outcome.is_some() {
                    return Ok(());
                }
                record.outcome = Some(outcome.clone());
            }
        }
        info!(negotiation = negotiation_id, kind = ?request.kind, "negotiation settled");

        let payload = serde_json::to_value(&outcome).unwrap_or_default();
        for participant in &request.participants {
            let message = TaskDispatch::new(
                negotiation_id,
                DispatchAction::AgreementBroadcast,
                payload.clone(),
            );
            if let Err(e) = self.channel.send(participant, message).await {
                warn!(negotiation = negotiation_id, agent = %participant, error = %e, "agreement broadcast failed");
            }
        }
        self.mirror_negotiation(negotiation_id).await;
        Ok(())
    }

    /// Fallback settlement for negotiations that expired with nothing
    /// accepted: resource contention gets a round-robin schedule, priority
    /// disputes are ranked by responsiveness, everything else stays
    /// unsettled.
    async fn auto_resolve(self: &Arc<Self>, negotiation_id: &str) {
        let Some(request) = self.negotiation(negotiation_id) else {
            return;
        };
        let participants: Vec<String> = request.participants.iter().cloned().collect();

        let (outcome, payload) = match request.kind {
            NegotiationKind::Resource => {
                let now = Utc::now();
                let slot = chrono::Duration::minutes(self.config.time_slot_minutes as i64);
                let slots: Vec<ScheduleSlot> = participants
                    .iter()
                    .enumerate()
                    .map(|(i, agent_id)| ScheduleSlot {
                        agent_id: agent_id.clone(),
                        starts_at: now + slot * i as i32,
                        duration_minutes: self.config.time_slot_minutes as i64,
                        priority: if i == 0 { Priority::High } else { Priority::Medium },
                    })
                    .collect();
                let mut conflict = ResourceConflict::detected(
                    request.subject.clone(),
                    request.participants.clone(),
                );
                conflict.resolve("round-robin time-sharing schedule", ResolutionMethod::Scheduling);
                let payload = json!({ "conflict": conflict, "schedule": slots });
                (NegotiationOutcome::Resolution(conflict), payload)
            }
            NegotiationKind::Priority => {
                let mut ranked: Vec<(String, u64)> = Vec::with_capacity(participants.len());
                for agent_id in &participants {
                    ranked.push((agent_id.clone(), self.avg_response_ms(agent_id).await));
                }
                ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                let tiers = [Priority::High, Priority::Medium, Priority::Low];
                let ranking: BTreeMap<String, Priority> = ranked
                    .iter()
                    .enumerate()
                    .map(|(i, (agent_id, _))| {
                        (agent_id.clone(), tiers[i.min(tiers.len() - 1)])
                    })
                    .collect();
                let mut conflict = ResourceConflict::detected(
                    request.subject.clone(),
                    request.participants.clone(),
                );
                conflict.resolve(
                    "priorities assigned by average response time",
                    ResolutionMethod::Priority,
                );
                let payload = json!({ "conflict": conflict, "priorities": ranking });
                (NegotiationOutcome::Resolution(conflict), payload)
            }
            NegotiationKind::Collaboration | NegotiationKind::Delegation => {
                warn!(
                    negotiation = negotiation_id,
                    error = %MeshError::NegotiationTimeout(negotiation_id.to_string()),
                    "no automatic resolution for this negotiation kind"
                );
                self.mirror_negotiation(negotiation_id).await;
                return;
            }
        };

        if let Some(record) = self.negotiations.write().get_mut(negotiation_id) {
            record.outcome = Some(outcome);
        }
        for participant in &participants {
            let message = TaskDispatch::new(
                negotiation_id,
                DispatchAction::NegotiationResolution,
                payload.clone(),
            );
            if let Err(e) = self.channel.send(participant, message).await {
                warn!(negotiation = negotiation_id, agent = %participant, error = %e, "resolution broadcast failed");
            }
        }
        self.mirror_negotiation(negotiation_id).await;
    }

    async fn build_agreement(&self, request: &NegotiationRequest) -> CollaborationAgreement {
        let mut roles = BTreeMap::new();
        let mut responsibilities = BTreeMap::new();
        let mut leader: Option<(u64, String)> = None;

        for participant in &request.participants {
            let capabilities = match self.directory.get_agent(participant).await {
                Ok(agent) => agent.capabilities,
                Err(_) => Vec::new(),
            };
            roles.insert(participant.clone(), role_for(&capabilities).to_string());
            responsibilities.insert(participant.clone(), capabilities);

            let response_ms = self.avg_response_ms(participant).await;
            let better = match &leader {
                Some((best, _)) => response_ms < *best,
                None => true,
            };
            if better {
                leader = Some((response_ms, participant.clone()));
            }
        }
        if let Some((_, leader_id)) = leader {
            roles.insert(leader_id, "leader".to_string());
        }

        CollaborationAgreement {
            id: Uuid::new_v4().to_string(),
            participants: request.participants.clone(),
            objective: request.subject.clone(),
            roles,
            responsibilities,
            status: AgreementStatus::Active,
            created_at: Utc::now(),
        }
    }

    /// Locally observed response times win; the directory's published
    /// summary is the fallback, and unknown agents rank last.
    async fn avg_response_ms(&self, agent_id: &str) -> u64 {
        if let Some((total, count)) = self.response_times.read().get(agent_id)
            && *count > 0
        {
            return total / count;
        }
        match self.directory.get_agent(agent_id).await {
            Ok(agent) if agent.performance.avg_response_ms > 0 => {
                agent.performance.avg_response_ms
            }
            _ => u64::MAX,
        }
    }

    fn record_response_time(&self, agent_id: &str, elapsed_ms: u64) {
        let mut times = self.response_times.write();
        let entry = times.entry(agent_id.to_string()).or_insert((0, 0));
        entry.0 += elapsed_ms;
        entry.1 += 1;
    }

    async fn mirror_negotiation(&self, negotiation_id: &str) {
        let snapshot = {
            let negotiations = self.negotiations.read();
            negotiations.get(negotiation_id).map(|r| {
                json!({
                    "request": r.request,
                    "offers": r.offers,
                    "outcome": r.outcome,
                })
            })
        };
        if let Some(snapshot) = snapshot {
            mirror_record(self.mirror.as_ref(), "negotiation", snapshot).await;
        }
    }
}

fn offer_timer_key(offer_id: &str) -> String {
    format!("offer:{offer_id}")
}

fn negotiation_timer_key(negotiation_id: &str) -> String {
    format!("negotiation:{negotiation_id}")
}

fn role_for(capabilities: &[String]) -> &'static str {
    let has = |needle: &str| capabilities.iter().any(|c| c.contains(needle));
    if has("plan") {
        "planner"
    } else if has("analy") {
        "analyst"
    } else if has("architect") || has("design") {
        "architect"
    } else {
        "contributor"
    }
}
