use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cluster::{ActivatedJob, ActivationCall, PartitionBatch, PartitionId, PartitionRouter};
use crate::config::LongPollConfig;
use crate::dispatch::{DispatchOutcome, DispatchRun, DispatchStep, PartitionRotation};
use crate::error::{ActivationError, PartitionError, Result};
use crate::lease::{ActivateJobsRequest, LeaseRequest, RequestId, ResponseSink};
use crate::longpoll::handle::LongPollHandle;
use crate::longpoll::ledger::{LeaseOutcomes, TypeDispatchLedger};
use crate::longpoll::timer::schedule_timeout;

/// Message types for the coordinator event loop
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// New activation request from a client
    Submit {
        request_id: RequestId,
        request: ActivateJobsRequest,
        sink: ResponseSink,
    },
    /// Answer of a partition to an activation call
    PartitionResponse {
        job_type: String,
        request_id: RequestId,
        partition_id: PartitionId,
        result: std::result::Result<PartitionBatch, PartitionError>,
    },
    /// Long polling timeout of a parked request elapsed
    Timeout {
        job_type: String,
        request_id: RequestId,
    },
    /// Jobs of a type became available
    JobsAvailable { job_type: String },
    /// Drain of a job type claimed by a notification
    NotificationDrain { job_type: String },
    Snapshot {
        response_tx: oneshot::Sender<CoordinatorSnapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTypeSnapshot {
    pub job_type: String,
    pub pending: usize,
    pub active: usize,
    pub failed_attempts: u32,
}

/// Point in time view of the coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub job_types: Vec<JobTypeSnapshot>,
    #[serde(flatten)]
    pub outcomes: LeaseOutcomes,
}

impl CoordinatorSnapshot {
    pub fn job_type(&self, job_type: &str) -> Option<&JobTypeSnapshot> {
        self.job_types.iter().find(|s| s.job_type == job_type)
    }
}

/// Owns every ledger and request and applies all mutations one message at a
/// time.
///
/// Partition calls, timers and notifications run on other tasks; their
/// results only ever come back as [`CoordinatorMessage`]s on the queue.
pub struct LongPollCoordinator {
    config: LongPollConfig,
    router: Arc<dyn PartitionRouter>,
    ledgers: HashMap<String, TypeDispatchLedger>,
    runs: HashMap<RequestId, DispatchRun>,
    rotation: PartitionRotation,
    /// Outcomes of ledgers that were already collected.
    retired: LeaseOutcomes,
    /// When the previous probe ran.
    last_probe: Instant,
    message_tx: mpsc::UnboundedSender<CoordinatorMessage>,
    next_request_id: Arc<AtomicU64>,
}

impl LongPollCoordinator {
    pub fn new(
        config: LongPollConfig,
        router: Arc<dyn PartitionRouter>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoordinatorMessage>)> {
        config.validate()?;
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            config,
            router,
            ledgers: HashMap::new(),
            runs: HashMap::new(),
            rotation: PartitionRotation::new(),
            retired: LeaseOutcomes::default(),
            last_probe: Instant::now(),
            message_tx,
            next_request_id: Arc::new(AtomicU64::new(1)),
        };

        Ok((coordinator, message_rx))
    }

    /// Client facing handle that submits requests to this coordinator
    pub fn handle(&self) -> LongPollHandle {
        LongPollHandle::new(self.message_tx.clone(), Arc::clone(&self.next_request_id))
    }

    /// Run the coordinator main loop until `shutdown` is cancelled
    pub async fn run(
        mut self,
        mut message_rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
        mut notifications: broadcast::Receiver<String>,
        shutdown: CancellationToken,
    ) {
        let mut probe = tokio::time::interval_at(
            Instant::now() + self.config.probe_timeout,
            self.config.probe_timeout,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notifications_open = true;
        self.last_probe = Instant::now();

        tracing::info!(
            enabled = self.config.enabled,
            timeout_ms = self.config.timeout.as_millis() as u64,
            probe_timeout_ms = self.config.probe_timeout.as_millis() as u64,
            min_empty_responses = self.config.min_empty_responses,
            "Long polling coordinator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                msg = message_rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },

                notification = notifications.recv(), if notifications_open => match notification {
                    Ok(job_type) => self.on_jobs_available(job_type),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Missed job notifications, relying on probe");
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("Job notification subscription closed");
                        notifications_open = false;
                    }
                },

                _ = probe.tick() => self.probe(),
            }
        }

        self.shutdown(&mut message_rx);
    }

    fn handle_message(&mut self, msg: CoordinatorMessage) {
        match msg {
            CoordinatorMessage::Submit {
                request_id,
                request,
                sink,
            } => self.submit(request_id, request, sink),
            CoordinatorMessage::PartitionResponse {
                job_type,
                request_id,
                partition_id,
                result,
            } => self.on_partition_response(&job_type, request_id, partition_id, result),
            CoordinatorMessage::Timeout {
                job_type,
                request_id,
            } => self.on_timeout(&job_type, request_id),
            CoordinatorMessage::JobsAvailable { job_type } => self.on_jobs_available(job_type),
            CoordinatorMessage::NotificationDrain { job_type } => {
                self.on_notification_drain(&job_type)
            }
            CoordinatorMessage::Snapshot { response_tx } => {
                let _ = response_tx.send(self.snapshot());
            }
        }
    }

    fn submit(&mut self, request_id: RequestId, request: ActivateJobsRequest, sink: ResponseSink) {
        let mut lease = LeaseRequest::new(request_id, request, sink);
        if let Err(err) = lease.request().validate() {
            tracing::debug!(request_id, error = %err, "Rejected invalid activation request");
            lease.fail(err);
            self.retired.record(lease.status());
            return;
        }

        let job_type = lease.job_type().to_string();
        tracing::debug!(
            request_id,
            job_type = %job_type,
            worker = lease.worker(),
            max_jobs = lease.max_jobs_to_activate(),
            "Received activation request"
        );

        self.ledgers
            .entry(job_type.clone())
            .or_insert_with(|| TypeDispatchLedger::new(job_type.as_str(), Instant::now()))
            .insert(lease);

        self.activate_or_park(&job_type, request_id);
    }

    fn activate_or_park(&mut self, job_type: &str, request_id: RequestId) {
        let threshold = self.config.min_empty_responses;
        let Some(ledger) = self.ledgers.get(job_type) else {
            return;
        };

        if !self.config.enabled || ledger.should_attempt_immediately(threshold) {
            self.start_attempt(job_type, request_id);
        } else {
            self.complete_or_park(job_type, request_id);
        }
    }

    fn start_attempt(&mut self, job_type: &str, request_id: RequestId) {
        let partition_count = self.router.partition_count();
        let Some(ledger) = self.ledgers.get_mut(job_type) else {
            return;
        };
        let Some(request) = ledger.get(request_id) else {
            return;
        };
        if !request.is_open() {
            self.retire(job_type, request_id);
            return;
        }

        let mut run = DispatchRun::start(request, &mut self.rotation, partition_count);
        let step = run.advance(request);
        ledger.mark_active(request_id);
        self.apply_step(job_type, request_id, run, step);
    }

    fn apply_step(
        &mut self,
        job_type: &str,
        request_id: RequestId,
        run: DispatchRun,
        step: DispatchStep,
    ) {
        match step {
            DispatchStep::Call(call) => {
                self.runs.insert(request_id, run);
                self.send_call(job_type, request_id, call);
            }
            DispatchStep::Done(outcome) => self.finish_attempt(job_type, request_id, outcome),
        }
    }

    fn send_call(&self, job_type: &str, request_id: RequestId, call: ActivationCall) {
        let router = Arc::clone(&self.router);
        let message_tx = self.message_tx.clone();
        let job_type = job_type.to_string();

        tokio::spawn(async move {
            let partition_id = call.partition_id;
            let result = router.activate(call).await;
            let _ = message_tx.send(CoordinatorMessage::PartitionResponse {
                job_type,
                request_id,
                partition_id,
                result,
            });
        });
    }

    fn on_partition_response(
        &mut self,
        job_type: &str,
        request_id: RequestId,
        partition_id: PartitionId,
        result: std::result::Result<PartitionBatch, PartitionError>,
    ) {
        let Some(mut run) = self.runs.remove(&request_id) else {
            self.discard_response(job_type, request_id, partition_id, result);
            return;
        };
        let Some(request) = self
            .ledgers
            .get_mut(job_type)
            .and_then(|ledger| ledger.get_mut(request_id))
        else {
            self.discard_response(job_type, request_id, partition_id, result);
            return;
        };

        let step = run.on_response(request, partition_id, result);
        self.apply_step(job_type, request_id, run, step);
    }

    fn discard_response(
        &self,
        job_type: &str,
        request_id: RequestId,
        partition_id: PartitionId,
        result: std::result::Result<PartitionBatch, PartitionError>,
    ) {
        tracing::debug!(
            request_id,
            job_type,
            partition_id,
            "Response for unknown activation attempt"
        );
        if let Ok(batch) = result {
            self.release(partition_id, batch.jobs);
        }
    }

    fn finish_attempt(&mut self, job_type: &str, request_id: RequestId, outcome: DispatchOutcome) {
        let summary = *outcome.summary();
        tracing::debug!(
            request_id,
            job_type,
            activated = summary.activated,
            batches = summary.batches,
            remaining = summary.remaining,
            resource_exhausted = summary.resource_exhausted_seen,
            "Activation attempt finished"
        );

        match outcome {
            DispatchOutcome::Undelivered {
                partition_id, jobs, ..
            } => {
                let found = summary.activated > 0 || !jobs.is_empty();
                self.release(partition_id, jobs);
                self.retire(job_type, request_id);
                if found {
                    self.reset_and_drain(job_type);
                    self.collect_if_idle(job_type);
                }
            }
            DispatchOutcome::Rejected { reason, .. } => {
                self.fail(
                    job_type,
                    request_id,
                    ActivationError::Rejected {
                        job_type: job_type.to_string(),
                        reason,
                    },
                );
            }
            DispatchOutcome::Finished(summary) => {
                let Some(ledger) = self.ledgers.get_mut(job_type) else {
                    return;
                };
                let Some(request) = ledger.get_mut(request_id) else {
                    return;
                };

                if !request.is_open() {
                    self.retire(job_type, request_id);
                    if summary.activated > 0 {
                        self.reset_and_drain(job_type);
                        self.collect_if_idle(job_type);
                    }
                } else if summary.activated > 0 {
                    request.complete();
                    self.retire(job_type, request_id);
                    self.reset_and_drain(job_type);
                    self.collect_if_idle(job_type);
                } else if summary.resource_exhausted_seen {
                    self.fail(
                        job_type,
                        request_id,
                        ActivationError::ResourceExhausted {
                            job_type: job_type.to_string(),
                        },
                    );
                } else {
                    ledger.record_failed_attempt(Instant::now());
                    let repeat = ledger.should_repeat(request_id);
                    ledger.unmark_active(request_id);

                    if repeat {
                        tracing::debug!(request_id, job_type, "Repeating attempt, jobs may have arrived");
                        self.start_attempt(job_type, request_id);
                    } else {
                        self.complete_or_park(job_type, request_id);
                    }
                }
            }
        }
    }

    /// Complete a request that found nothing, or park it until jobs arrive.
    fn complete_or_park(&mut self, job_type: &str, request_id: RequestId) {
        let enabled = self.config.enabled;
        let default_timeout = self.config.timeout;
        let Some(ledger) = self.ledgers.get_mut(job_type) else {
            return;
        };
        let Some(request) = ledger.get_mut(request_id) else {
            return;
        };

        if !request.is_open() {
            self.retire(job_type, request_id);
            return;
        }

        if !enabled || request.is_long_polling_disabled() {
            request.complete();
            self.retire(job_type, request_id);
            return;
        }

        if !request.has_scheduled_timer() {
            let timeout = request.effective_timeout(default_timeout);
            let timer = schedule_timeout(
                timeout,
                self.message_tx.clone(),
                job_type.to_string(),
                request_id,
            );
            request.set_timer(timer);
        }

        ledger.enqueue(request_id);
        tracing::debug!(
            request_id,
            job_type,
            pending = ledger.pending_len(),
            failed_attempts = ledger.failed_attempts(),
            "Parked activation request"
        );
    }

    fn on_timeout(&mut self, job_type: &str, request_id: RequestId) {
        let Some(ledger) = self.ledgers.get_mut(job_type) else {
            return;
        };
        let active = ledger.is_active(request_id);
        ledger.remove_pending(request_id);
        let Some(request) = ledger.get_mut(request_id) else {
            return;
        };

        request.timeout();
        tracing::debug!(request_id, job_type, active, "Activation request timed out");

        // an in-flight attempt retires the request once its response is in
        if !active {
            self.retire(job_type, request_id);
        }
    }

    fn on_jobs_available(&mut self, job_type: String) {
        let Some(ledger) = self.ledgers.get_mut(&job_type) else {
            tracing::trace!(job_type = %job_type, "Jobs available for unknown job type");
            return;
        };

        if ledger.start_notification_if_idle() {
            let _ = self
                .message_tx
                .send(CoordinatorMessage::NotificationDrain { job_type });
        } else {
            tracing::debug!(job_type = %job_type, "Coalesced job notification");
        }
    }

    fn on_notification_drain(&mut self, job_type: &str) {
        self.reset_and_drain(job_type);
        if let Some(ledger) = self.ledgers.get_mut(job_type) {
            ledger.finish_notification();
        }
        self.collect_if_idle(job_type);
    }

    /// Reset the throttle and re-dispatch every parked request in FIFO order.
    fn reset_and_drain(&mut self, job_type: &str) {
        let Some(ledger) = self.ledgers.get_mut(job_type) else {
            return;
        };
        ledger.reset_failed_attempts();
        let parked = ledger.drain_pending();
        if !parked.is_empty() {
            tracing::debug!(job_type, resumed = parked.len(), "Resuming parked requests");
        }
        for request_id in parked {
            self.activate_or_park(job_type, request_id);
        }
    }

    /// Job types without activity since the previous probe, other than the
    /// probe's own dispatch, get one parked request dispatched or their
    /// throttle relaxed by one step.
    fn probe(&mut self) {
        let threshold = self.config.min_empty_responses;
        let since = std::mem::replace(&mut self.last_probe, Instant::now());
        let mut probes = Vec::new();

        for (job_type, ledger) in self.ledgers.iter_mut() {
            ledger.prune();
            if !ledger.probe_due(since) {
                continue;
            }

            if let Some(request_id) = ledger.next_pending() {
                ledger.mark_probed();
                probes.push((job_type.clone(), request_id));
            } else if ledger.failed_attempts() >= threshold {
                ledger.decrement_failed_attempts();
                tracing::debug!(
                    job_type = %job_type,
                    failed_attempts = ledger.failed_attempts(),
                    "Probe relaxed throttle"
                );
            }
        }

        for (job_type, request_id) in probes {
            tracing::debug!(request_id, job_type = %job_type, "Probing with parked request");
            self.start_attempt(&job_type, request_id);
        }

        let idle: Vec<String> = self
            .ledgers
            .iter()
            .filter(|(_, ledger)| ledger.is_collectable(threshold))
            .map(|(job_type, _)| job_type.clone())
            .collect();
        for job_type in idle {
            self.collect_if_idle(&job_type);
        }
    }

    fn collect_if_idle(&mut self, job_type: &str) {
        let threshold = self.config.min_empty_responses;
        if !self
            .ledgers
            .get(job_type)
            .is_some_and(|ledger| ledger.is_collectable(threshold))
        {
            return;
        }
        // the rotation cursor of the type is kept
        if let Some(ledger) = self.ledgers.remove(job_type) {
            self.retired.merge(ledger.outcomes());
            tracing::debug!(job_type, "Collected idle job type");
        }
    }

    fn fail(&mut self, job_type: &str, request_id: RequestId, err: ActivationError) {
        if let Some(request) = self
            .ledgers
            .get_mut(job_type)
            .and_then(|ledger| ledger.get_mut(request_id))
        {
            tracing::debug!(request_id, job_type, error = %err, "Activation request failed");
            request.fail(err);
        }
        self.retire(job_type, request_id);
    }

    fn retire(&mut self, job_type: &str, request_id: RequestId) {
        self.runs.remove(&request_id);
        if let Some(ledger) = self.ledgers.get_mut(job_type) {
            ledger.retire(request_id);
        }
    }

    fn release(&self, partition_id: PartitionId, jobs: Vec<ActivatedJob>) {
        if jobs.is_empty() {
            return;
        }
        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            let count = jobs.len();
            match router.release(partition_id, jobs).await {
                Ok(()) => tracing::debug!(partition_id, count, "Released undelivered jobs"),
                Err(e) => tracing::warn!(
                    partition_id,
                    count,
                    error = %e,
                    "Failed to release undelivered jobs, they return once their lease expires"
                ),
            }
        });
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        let mut outcomes = self.retired;
        let mut job_types: Vec<JobTypeSnapshot> = self
            .ledgers
            .values()
            .map(|ledger| {
                outcomes.merge(ledger.outcomes());
                JobTypeSnapshot {
                    job_type: ledger.job_type().to_string(),
                    pending: ledger.pending_len(),
                    active: ledger.active_len(),
                    failed_attempts: ledger.failed_attempts(),
                }
            })
            .collect();
        job_types.sort_by(|a, b| a.job_type.cmp(&b.job_type));

        CoordinatorSnapshot {
            job_types,
            outcomes,
        }
    }

    fn shutdown(&mut self, message_rx: &mut mpsc::UnboundedReceiver<CoordinatorMessage>) {
        let mut open = 0usize;
        for ledger in self.ledgers.values_mut() {
            for request_id in ledger.request_ids() {
                if let Some(request) = ledger.get_mut(request_id) {
                    if request.is_open() {
                        open += 1;
                        request.fail(shutting_down());
                    }
                }
                ledger.retire(request_id);
            }
        }
        self.runs.clear();

        // requests still queued never reached a ledger
        message_rx.close();
        let mut queued = 0usize;
        while let Ok(msg) = message_rx.try_recv() {
            match msg {
                CoordinatorMessage::Submit { mut sink, .. } => {
                    queued += 1;
                    sink.error(shutting_down());
                }
                CoordinatorMessage::PartitionResponse {
                    partition_id,
                    result: Ok(batch),
                    ..
                } => self.release(partition_id, batch.jobs),
                _ => {}
            }
        }

        tracing::info!(
            open_requests = open,
            queued_requests = queued,
            "Long polling coordinator stopped"
        );
    }
}

fn shutting_down() -> ActivationError {
    ActivationError::Unavailable("gateway is shutting down".to_string())
}
