use chrono::{DateTime, Duration, Utc};

use crate::decompose::Priority;

use super::types::TaskRequest;

/// A task waiting for distribution.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub request: TaskRequest,
    pub enqueued_at: DateTime<Utc>,
    /// Priority override, set when a timed-out task is re-queued boosted.
    pub boosted: Option<Priority>,
    /// Consecutive cycles with no viable candidate.
    pub barren_cycles: u32,
}

impl QueuedTask {
    pub fn new(request: TaskRequest) -> Self {
        Self {
            request,
            enqueued_at: Utc::now(),
            boosted: None,
            barren_cycles: 0,
        }
    }

    pub fn boosted(request: TaskRequest, priority: Priority) -> Self {
        Self {
            boosted: Some(priority),
            ..Self::new(request)
        }
    }

    pub fn priority(&self) -> Priority {
        self.boosted.unwrap_or(self.request.priority)
    }

    /// Base priority score plus deadline pressure: +2 past the deadline,
    /// +1 when it is close.
    pub fn effective_priority(&self, now: DateTime<Utc>, deadline_soon_mins: i64) -> u32 {
        let mut score = self.priority().base_score();
        if let Some(deadline) = self.request.deadline {
            if deadline <= now {
                score += 2;
            } else if deadline - now <= Duration::minutes(deadline_soon_mins) {
                score += 1;
            }
        }
        score
    }
}
