use crate::cluster::{ActivatedJob, ActivationCall, PartitionBatch, PartitionId};
use crate::dispatch::rotation::{PartitionRotation, PartitionWalk};
use crate::error::PartitionError;
use crate::lease::{LeaseRequest, RequestId};

/// Totals of one pass over the partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Batches pushed to the client.
    pub batches: u32,
    /// Jobs pushed to the client.
    pub activated: u32,
    /// Jobs still wanted when the pass ended.
    pub remaining: u32,
    pub resource_exhausted_seen: bool,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Enough jobs were collected or every partition was visited.
    Finished(RunSummary),
    /// A partition rejected the command; the pass was abandoned.
    Rejected { summary: RunSummary, reason: String },
    /// Jobs were activated but could not be handed to the client, either
    /// because its stream is gone or because the request is no longer open.
    Undelivered {
        summary: RunSummary,
        partition_id: PartitionId,
        jobs: Vec<ActivatedJob>,
    },
}

impl DispatchOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            DispatchOutcome::Finished(summary) => summary,
            DispatchOutcome::Rejected { summary, .. } => summary,
            DispatchOutcome::Undelivered { summary, .. } => summary,
        }
    }
}

/// What the owner of a run has to do next.
#[derive(Debug)]
pub enum DispatchStep {
    /// Send this call and feed its result to [`DispatchRun::on_response`].
    Call(ActivationCall),
    Done(DispatchOutcome),
}

/// State of a single pass over the partitions on behalf of one request.
///
/// The run never performs I/O itself. It hands out one [`ActivationCall`] at a
/// time and is resumed with the partition's answer, so the caller decides on
/// which task the response is processed.
///
/// Partitions are visited starting at the job type's rotation cursor. A
/// truncated response makes the next call go to the same partition again,
/// which drains partitions known to hold more jobs before moving on.
#[derive(Debug)]
pub struct DispatchRun {
    request_id: RequestId,
    job_type: String,
    walk: PartitionWalk,
    current: Option<PartitionId>,
    repeat_current: bool,
    summary: RunSummary,
}

impl DispatchRun {
    pub fn start(
        request: &LeaseRequest,
        rotation: &mut PartitionRotation,
        partition_count: u32,
    ) -> Self {
        let walk = match rotation.next(request.job_type(), partition_count) {
            Some(start) => PartitionWalk::new(start, partition_count),
            None => PartitionWalk::empty(),
        };

        Self {
            request_id: request.id(),
            job_type: request.job_type().to_string(),
            walk,
            current: None,
            repeat_current: false,
            summary: RunSummary {
                remaining: request.max_jobs_to_activate(),
                ..Default::default()
            },
        }
    }

    /// True if the next call targets the partition of the previous one.
    pub fn is_repeating(&self) -> bool {
        self.repeat_current
    }

    /// Pick the next partition to call, or finish the run.
    pub fn advance(&mut self, request: &LeaseRequest) -> DispatchStep {
        if self.summary.remaining == 0 {
            return DispatchStep::Done(DispatchOutcome::Finished(self.summary));
        }

        let next = if self.repeat_current {
            self.current
        } else {
            self.walk.next()
        };

        match next {
            Some(partition_id) => {
                self.current = Some(partition_id);
                tracing::trace!(
                    request_id = self.request_id,
                    job_type = %self.job_type,
                    partition_id,
                    remaining = self.summary.remaining,
                    repeat = self.repeat_current,
                    "Activating jobs on partition"
                );
                DispatchStep::Call(ActivationCall {
                    partition_id,
                    job_type: self.job_type.clone(),
                    worker: request.worker().to_string(),
                    max_jobs: self.summary.remaining,
                    lease_timeout: request.request().lease_timeout,
                    fetch_variables: request.request().fetch_variables.clone(),
                })
            }
            None => DispatchStep::Done(DispatchOutcome::Finished(self.summary)),
        }
    }

    /// Account for one partition's answer and pick the next step.
    pub fn on_response(
        &mut self,
        request: &mut LeaseRequest,
        partition_id: PartitionId,
        result: Result<PartitionBatch, PartitionError>,
    ) -> DispatchStep {
        match result {
            Ok(batch) => {
                let count = batch.jobs.len() as u32;

                if !request.is_open() {
                    return DispatchStep::Done(DispatchOutcome::Undelivered {
                        summary: self.summary,
                        partition_id,
                        jobs: batch.jobs,
                    });
                }

                if count > 0 {
                    if let Err(jobs) = request.push_partial(batch.jobs) {
                        return DispatchStep::Done(DispatchOutcome::Undelivered {
                            summary: self.summary,
                            partition_id,
                            jobs,
                        });
                    }
                    self.summary.batches += 1;
                    self.summary.activated += count;
                }

                self.summary.remaining = self.summary.remaining.saturating_sub(count);
                // an empty batch flagged truncated would otherwise loop forever
                self.repeat_current = batch.truncated && count > 0;
            }
            Err(err) if err.is_rejection() => {
                let reason = match err {
                    PartitionError::Rejected { reason } => reason,
                    other => other.to_string(),
                };
                return DispatchStep::Done(DispatchOutcome::Rejected {
                    summary: self.summary,
                    reason,
                });
            }
            Err(err) if err.is_resource_exhausted() => {
                tracing::warn!(
                    request_id = self.request_id,
                    job_type = %self.job_type,
                    partition_id,
                    error = %err,
                    "Partition exhausted, trying next partition"
                );
                self.summary.resource_exhausted_seen = true;
                self.repeat_current = false;
            }
            Err(err) => {
                tracing::warn!(
                    request_id = self.request_id,
                    job_type = %self.job_type,
                    partition_id,
                    error = %err,
                    "Failed to activate jobs on partition"
                );
                self.repeat_current = false;
            }
        }

        if !request.is_open() {
            return DispatchStep::Done(DispatchOutcome::Undelivered {
                summary: self.summary,
                partition_id,
                jobs: Vec::new(),
            });
        }
        self.advance(request)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::lease::sink::{self, ActivateJobsStream};
    use crate::lease::ActivateJobsRequest;

    fn lease(max_jobs: i32) -> (LeaseRequest, ActivateJobsStream) {
        let (sink, stream) = sink::channel();
        let request = ActivateJobsRequest::new("payment", max_jobs)
            .with_worker("worker-1")
            .with_lease_timeout(Duration::from_secs(60));
        (LeaseRequest::new(9, request, sink), stream)
    }

    fn jobs(partition_id: PartitionId, count: usize) -> Vec<ActivatedJob> {
        (0..count)
            .map(|i| ActivatedJob {
                key: i as i64,
                job_type: "payment".to_string(),
                partition_id,
                worker: "worker-1".to_string(),
                retries: 3,
                deadline: Utc::now(),
                variables: serde_json::Value::Null,
            })
            .collect()
    }

    fn expect_call(step: DispatchStep) -> ActivationCall {
        match step {
            DispatchStep::Call(call) => call,
            DispatchStep::Done(outcome) => panic!("expected a call, got {:?}", outcome),
        }
    }

    fn expect_done(step: DispatchStep) -> DispatchOutcome {
        match step {
            DispatchStep::Done(outcome) => outcome,
            DispatchStep::Call(call) => panic!("expected the run to end, got {:?}", call),
        }
    }

    #[test]
    fn visits_every_partition_once_from_rotation_start() {
        let (mut request, _stream) = lease(5);
        let mut rotation = PartitionRotation::new();
        rotation.next("payment", 3);

        let mut run = DispatchRun::start(&request, &mut rotation, 3);
        let mut visited = Vec::new();
        let mut step = run.advance(&request);
        while let DispatchStep::Call(call) = step {
            assert_eq!(call.max_jobs, 5);
            assert_eq!(call.worker, "worker-1");
            assert_eq!(call.lease_timeout, Duration::from_secs(60));
            visited.push(call.partition_id);
            step = run.on_response(&mut request, call.partition_id, Ok(PartitionBatch::empty()));
        }

        assert_eq!(visited, vec![2, 3, 1]);
        let summary = *expect_done(step).summary();
        assert_eq!(summary.activated, 0);
        assert_eq!(summary.remaining, 5);
        assert!(!summary.resource_exhausted_seen);
    }

    #[test]
    fn truncated_response_repeats_partition() {
        let (mut request, _stream) = lease(10);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 2);

        let first = expect_call(run.advance(&request));
        assert_eq!(first.partition_id, 1);

        let second = expect_call(run.on_response(
            &mut request,
            1,
            Ok(PartitionBatch::new(jobs(1, 2), true)),
        ));
        assert_eq!(second.partition_id, 1);
        assert_eq!(second.max_jobs, 8);
        assert!(run.is_repeating());

        let third = expect_call(run.on_response(
            &mut request,
            1,
            Ok(PartitionBatch::new(jobs(1, 2), false)),
        ));
        assert_eq!(third.partition_id, 2);
        assert_eq!(third.max_jobs, 6);

        let outcome = expect_done(run.on_response(&mut request, 2, Ok(PartitionBatch::empty())));
        let summary = outcome.summary();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.activated, 4);
        assert_eq!(summary.remaining, 6);
        assert_eq!(request.delivered(), 4);
    }

    #[test]
    fn stops_once_enough_jobs_collected() {
        let (mut request, _stream) = lease(3);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 4);

        let call = expect_call(run.advance(&request));
        let outcome = expect_done(run.on_response(
            &mut request,
            call.partition_id,
            Ok(PartitionBatch::new(jobs(1, 3), true)),
        ));
        assert!(matches!(outcome, DispatchOutcome::Finished(s) if s.remaining == 0 && s.activated == 3));
    }

    #[test]
    fn resource_exhaustion_is_recorded_and_skipped() {
        let (mut request, _stream) = lease(2);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 2);

        let call = expect_call(run.advance(&request));
        let next = expect_call(run.on_response(
            &mut request,
            call.partition_id,
            Err(PartitionError::ResourceExhausted("backpressure".to_string())),
        ));
        assert_ne!(next.partition_id, call.partition_id);
        assert!(!run.is_repeating());

        let outcome = expect_done(run.on_response(
            &mut request,
            next.partition_id,
            Ok(PartitionBatch::new(jobs(next.partition_id, 1), false)),
        ));
        let summary = outcome.summary();
        assert!(summary.resource_exhausted_seen);
        assert_eq!(summary.activated, 1);
    }

    #[test]
    fn other_errors_move_on() {
        let (mut request, _stream) = lease(2);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 2);

        let call = expect_call(run.advance(&request));
        let next = expect_call(run.on_response(
            &mut request,
            call.partition_id,
            Err(PartitionError::Unavailable("no leader".to_string())),
        ));
        assert_eq!(next.partition_id, 2);
        let outcome = expect_done(run.on_response(&mut request, 2, Ok(PartitionBatch::empty())));
        assert!(!outcome.summary().resource_exhausted_seen);
    }

    #[test]
    fn rejection_aborts_the_run() {
        let (mut request, _stream) = lease(2);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 3);

        let call = expect_call(run.advance(&request));
        let outcome = expect_done(run.on_response(
            &mut request,
            call.partition_id,
            Err(PartitionError::Rejected {
                reason: "unknown job type".to_string(),
            }),
        ));
        assert!(matches!(
            outcome,
            DispatchOutcome::Rejected { ref reason, .. } if reason == "unknown job type"
        ));
    }

    #[test]
    fn closed_stream_returns_jobs_as_undelivered() {
        let (mut request, stream) = lease(4);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 2);
        drop(stream);

        let call = expect_call(run.advance(&request));
        let outcome = expect_done(run.on_response(
            &mut request,
            call.partition_id,
            Ok(PartitionBatch::new(jobs(1, 2), false)),
        ));
        match outcome {
            DispatchOutcome::Undelivered {
                partition_id, jobs, ..
            } => {
                assert_eq!(partition_id, 1);
                assert_eq!(jobs.len(), 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn empty_topology_finishes_immediately() {
        let (request, _stream) = lease(1);
        let mut rotation = PartitionRotation::new();
        let mut run = DispatchRun::start(&request, &mut rotation, 0);
        let outcome = expect_done(run.advance(&request));
        assert!(matches!(outcome, DispatchOutcome::Finished(s) if s.remaining == 1));
    }
}
