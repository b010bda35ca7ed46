use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cluster::ActivatedJob;
use crate::error::ActivationError;
use crate::lease::sink::{JobBatch, ResponseSink};

pub type RequestId = u64;

pub const DEFAULT_WORKER: &str = "default";
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Parameters of a client's activation request.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateJobsRequest {
    pub job_type: String,
    pub worker: String,
    pub max_jobs_to_activate: i32,
    /// Long polling timeout in milliseconds. `None` or `0` uses the
    /// coordinator default, a negative value disables long polling.
    pub request_timeout_ms: Option<i64>,
    /// How long activated jobs stay leased to the worker.
    pub lease_timeout: Duration,
    /// Variables to fetch; empty fetches all.
    pub fetch_variables: Vec<String>,
}

impl ActivateJobsRequest {
    pub fn new(job_type: impl Into<String>, max_jobs_to_activate: i32) -> Self {
        Self {
            job_type: job_type.into(),
            worker: DEFAULT_WORKER.to_string(),
            max_jobs_to_activate,
            request_timeout_ms: None,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            fetch_variables: Vec::new(),
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.request_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_fetch_variables(mut self, variables: Vec<String>) -> Self {
        self.fetch_variables = variables;
        self
    }

    pub fn validate(&self) -> Result<(), ActivationError> {
        if self.job_type.trim().is_empty() {
            return Err(ActivationError::InvalidArgument(
                "job type must not be empty".to_string(),
            ));
        }
        if self.max_jobs_to_activate <= 0 {
            return Err(ActivationError::InvalidArgument(format!(
                "max jobs to activate must be greater than 0, was {}",
                self.max_jobs_to_activate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Open,
    Completed,
    /// Completed because the long polling timeout elapsed.
    TimedOut,
    Canceled,
    Aborted,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseStatus::Open => write!(f, "open"),
            LeaseStatus::Completed => write!(f, "completed"),
            LeaseStatus::TimedOut => write!(f, "timed_out"),
            LeaseStatus::Canceled => write!(f, "canceled"),
            LeaseStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// One in-flight activation request and its response sink.
///
/// Once the status leaves `Open` it never changes again, and the sink has
/// received at most one terminal signal.
#[derive(Debug)]
pub struct LeaseRequest {
    id: RequestId,
    request: ActivateJobsRequest,
    sink: ResponseSink,
    timer: Option<CancellationToken>,
    status: LeaseStatus,
    delivered: usize,
}

impl LeaseRequest {
    pub fn new(id: RequestId, request: ActivateJobsRequest, sink: ResponseSink) -> Self {
        Self {
            id,
            request,
            sink,
            timer: None,
            status: LeaseStatus::Open,
            delivered: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn request(&self) -> &ActivateJobsRequest {
        &self.request
    }

    pub fn job_type(&self) -> &str {
        &self.request.job_type
    }

    pub fn worker(&self) -> &str {
        &self.request.worker
    }

    pub fn max_jobs_to_activate(&self) -> u32 {
        u32::try_from(self.request.max_jobs_to_activate).unwrap_or(0)
    }

    /// Jobs pushed to the client so far.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Current status, reporting a disconnected client as canceled even if the
    /// coordinator has not observed it yet.
    pub fn status(&self) -> LeaseStatus {
        if self.status == LeaseStatus::Open && self.sink.is_canceled() {
            LeaseStatus::Canceled
        } else {
            self.status
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() == LeaseStatus::Open
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, LeaseStatus::Completed | LeaseStatus::TimedOut)
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == LeaseStatus::TimedOut
    }

    pub fn is_aborted(&self) -> bool {
        self.status == LeaseStatus::Aborted
    }

    pub fn is_canceled(&self) -> bool {
        self.status() == LeaseStatus::Canceled
    }

    /// Record a client disconnect. Returns true if the request transitioned
    /// to canceled with this call.
    pub fn observe_cancellation(&mut self) -> bool {
        if self.status == LeaseStatus::Open && self.sink.is_canceled() {
            self.cancel_timer();
            self.status = LeaseStatus::Canceled;
            return true;
        }
        false
    }

    pub fn effective_timeout(&self, default: Duration) -> Duration {
        match self.request.request_timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
            _ => default,
        }
    }

    pub fn is_long_polling_disabled(&self) -> bool {
        matches!(self.request.request_timeout_ms, Some(ms) if ms < 0)
    }

    pub fn has_scheduled_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn set_timer(&mut self, timer: CancellationToken) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.cancel();
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Push jobs to the client without ending the stream. If the client is
    /// gone the jobs are handed back so they can be released.
    pub fn push_partial(&mut self, jobs: Vec<ActivatedJob>) -> Result<(), Vec<ActivatedJob>> {
        if !self.is_open() {
            return Err(jobs);
        }
        let count = jobs.len();
        match self.sink.push_batch(JobBatch::new(jobs)) {
            Ok(()) => {
                self.delivered += count;
                Ok(())
            }
            Err(batch) => {
                tracing::warn!(
                    request_id = self.id,
                    job_type = %self.request.job_type,
                    jobs = batch.len(),
                    "Failed to push jobs, client is gone"
                );
                Err(batch.jobs)
            }
        }
    }

    pub fn complete(&mut self) {
        self.finish(LeaseStatus::Completed);
    }

    /// Complete because the long polling timeout elapsed.
    pub fn timeout(&mut self) {
        self.finish(LeaseStatus::TimedOut);
    }

    pub fn fail(&mut self, err: ActivationError) {
        if !self.is_open() {
            return;
        }
        self.cancel_timer();
        self.sink.error(err);
        self.status = LeaseStatus::Aborted;
    }

    fn finish(&mut self, status: LeaseStatus) {
        if !self.is_open() {
            return;
        }
        self.cancel_timer();
        self.sink.complete();
        self.status = status;
    }
}
