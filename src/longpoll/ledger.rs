use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tokio::time::Instant;

use crate::lease::{LeaseRequest, LeaseStatus, RequestId};

/// Terminal outcomes of retired requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeaseOutcomes {
    pub completed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub canceled: u64,
}

impl LeaseOutcomes {
    pub fn record(&mut self, status: LeaseStatus) {
        match status {
            LeaseStatus::Open => {}
            LeaseStatus::Completed => self.completed += 1,
            LeaseStatus::TimedOut => self.timed_out += 1,
            LeaseStatus::Aborted => self.aborted += 1,
            LeaseStatus::Canceled => self.canceled += 1,
        }
    }

    pub fn merge(&mut self, other: &LeaseOutcomes) {
        self.completed += other.completed;
        self.timed_out += other.timed_out;
        self.aborted += other.aborted;
        self.canceled += other.canceled;
    }
}

/// Bookkeeping for all requests of one job type.
///
/// Requests live in a table keyed by id; the pending queue, active set and
/// repeat set only hold ids. A request id is never in both pending and
/// active. Only the coordinator task touches a ledger.
#[derive(Debug)]
pub struct TypeDispatchLedger {
    job_type: String,
    requests: HashMap<RequestId, LeaseRequest>,
    pending: VecDeque<RequestId>,
    active: HashSet<RequestId>,
    repeat: HashSet<RequestId>,
    failed_attempts: u32,
    last_activity: Instant,
    notification_in_flight: bool,
    probed: bool,
    outcomes: LeaseOutcomes,
}

impl TypeDispatchLedger {
    pub fn new(job_type: impl Into<String>, now: Instant) -> Self {
        Self {
            job_type: job_type.into(),
            requests: HashMap::new(),
            pending: VecDeque::new(),
            active: HashSet::new(),
            repeat: HashSet::new(),
            failed_attempts: 0,
            last_activity: now,
            notification_in_flight: false,
            probed: false,
            outcomes: LeaseOutcomes::default(),
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Track a request without queueing it.
    pub fn insert(&mut self, request: LeaseRequest) {
        self.requests.insert(request.id(), request);
    }

    pub fn get(&self, id: RequestId) -> Option<&LeaseRequest> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut LeaseRequest> {
        self.requests.get_mut(&id)
    }

    /// Append a tracked request to the pending queue. Returns false if the
    /// request is unknown, no longer open, or already pending or active.
    pub fn enqueue(&mut self, id: RequestId) -> bool {
        self.prune();
        let open = self.requests.get(&id).is_some_and(|r| r.is_open());
        if !open || self.active.contains(&id) || self.pending.contains(&id) {
            return false;
        }
        self.pending.push_back(id);
        true
    }

    /// Pop the oldest pending request that is still open.
    pub fn next_pending(&mut self) -> Option<RequestId> {
        self.prune();
        self.pending.pop_front()
    }

    /// Take every pending request in the order they were parked.
    pub fn drain_pending(&mut self) -> Vec<RequestId> {
        self.prune();
        self.pending.drain(..).collect()
    }

    pub fn remove_pending(&mut self, id: RequestId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|pending| *pending != id);
        before != self.pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains(&id)
    }

    pub fn mark_active(&mut self, id: RequestId) {
        self.remove_pending(id);
        self.active.insert(id);
    }

    pub fn unmark_active(&mut self, id: RequestId) {
        self.active.remove(&id);
        self.repeat.remove(&id);
    }

    pub fn is_active(&self, id: RequestId) -> bool {
        self.active.contains(&id)
    }

    pub fn record_failed_attempt(&mut self, now: Instant) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.last_activity = now;
    }

    /// Zero the failure counter. Requests with an attempt in flight are
    /// flagged so an empty result re-runs them instead of parking.
    pub fn reset_failed_attempts(&mut self) {
        self.failed_attempts = 0;
        self.repeat.extend(self.active.iter().copied());
    }

    pub fn decrement_failed_attempts(&mut self) {
        self.failed_attempts = self.failed_attempts.saturating_sub(1);
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Note that a probe dispatched a request of this type.
    pub fn mark_probed(&mut self) {
        self.probed = true;
    }

    /// True if nothing but the previous probe touched this type after
    /// `since`. Clears the probe mark.
    pub fn probe_due(&mut self, since: Instant) -> bool {
        let probed = std::mem::take(&mut self.probed);
        probed || self.last_activity <= since
    }

    pub fn should_attempt_immediately(&self, threshold: u32) -> bool {
        self.failed_attempts < threshold
    }

    pub fn should_repeat(&self, id: RequestId) -> bool {
        self.repeat.contains(&id)
            && self
                .requests
                .get(&id)
                .is_some_and(|r| !r.is_long_polling_disabled())
    }

    /// Claim the notification guard. Returns false if a drain triggered by a
    /// notification is already in flight.
    pub fn start_notification_if_idle(&mut self) -> bool {
        if self.notification_in_flight {
            return false;
        }
        self.notification_in_flight = true;
        true
    }

    pub fn finish_notification(&mut self) {
        self.notification_in_flight = false;
    }

    /// Remove a request from every collection and record its outcome.
    pub fn retire(&mut self, id: RequestId) -> Option<LeaseRequest> {
        self.remove_pending(id);
        self.unmark_active(id);
        let mut request = self.requests.remove(&id)?;
        request.observe_cancellation();
        request.cancel_timer();
        self.outcomes.record(request.status());
        Some(request)
    }

    /// Retire pending requests that are no longer open.
    pub fn prune(&mut self) -> usize {
        let obsolete: Vec<RequestId> = self
            .pending
            .iter()
            .copied()
            .filter(|id| self.requests.get(id).map_or(true, |r| !r.is_open()))
            .collect();

        for id in &obsolete {
            if self.retire(*id).is_none() {
                self.remove_pending(*id);
            }
        }
        if !obsolete.is_empty() {
            tracing::debug!(
                job_type = %self.job_type,
                pruned = obsolete.len(),
                "Pruned obsolete pending requests"
            );
        }
        obsolete.len()
    }

    /// Ids of every tracked request.
    pub fn request_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn outcomes(&self) -> &LeaseOutcomes {
        &self.outcomes
    }

    /// True once the ledger holds nothing worth keeping: no requests, no
    /// notification drain in flight and no engaged throttle.
    pub fn is_collectable(&self, threshold: u32) -> bool {
        self.requests.is_empty()
            && !self.notification_in_flight
            && self.failed_attempts < threshold
    }
}
