//! Mapping between activation errors and gRPC status codes, for transports
//! that expose the activation stream over tonic.

use std::pin::Pin;

use tokio_stream::{Stream, StreamExt};
use tonic::{Code, Status};

use crate::error::{ActivationError, PartitionError};
use crate::lease::{ActivateJobsStream, JobBatch};

pub type ActivateJobsStatusStream = Pin<Box<dyn Stream<Item = Result<JobBatch, Status>> + Send>>;

impl From<ActivationError> for Status {
    fn from(err: ActivationError) -> Self {
        let message = err.to_string();
        match err {
            ActivationError::InvalidArgument(_) | ActivationError::Rejected { .. } => {
                Status::invalid_argument(message)
            }
            ActivationError::ResourceExhausted { .. } => Status::resource_exhausted(message),
            ActivationError::Unavailable(_) => Status::unavailable(message),
        }
    }
}

/// Classify a status returned by a remote partition.
impl From<Status> for PartitionError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::ResourceExhausted => PartitionError::ResourceExhausted(message),
            Code::InvalidArgument | Code::NotFound | Code::FailedPrecondition => {
                PartitionError::Rejected { reason: message }
            }
            Code::Unavailable | Code::DeadlineExceeded => PartitionError::Unavailable(message),
            _ => PartitionError::Internal(message),
        }
    }
}

/// Turn an activation stream into the shape a tonic server streaming handler
/// returns.
pub fn into_status_stream(stream: ActivateJobsStream) -> ActivateJobsStatusStream {
    Box::pin(stream.map(|item| item.map_err(Status::from)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::sink;

    #[test]
    fn activation_errors_map_to_codes() {
        let cases = [
            (
                ActivationError::InvalidArgument("max jobs".to_string()),
                Code::InvalidArgument,
            ),
            (
                ActivationError::Rejected {
                    job_type: "payment".to_string(),
                    reason: "unknown".to_string(),
                },
                Code::InvalidArgument,
            ),
            (
                ActivationError::ResourceExhausted {
                    job_type: "payment".to_string(),
                },
                Code::ResourceExhausted,
            ),
            (
                ActivationError::Unavailable("stopping".to_string()),
                Code::Unavailable,
            ),
        ];

        for (err, code) in cases {
            let status = Status::from(err);
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn partition_status_is_classified() {
        assert!(PartitionError::from(Status::resource_exhausted("busy")).is_resource_exhausted());
        assert!(PartitionError::from(Status::not_found("no such type")).is_rejection());
        assert_eq!(
            PartitionError::from(Status::deadline_exceeded("slow")),
            PartitionError::Unavailable("slow".to_string())
        );
        assert_eq!(
            PartitionError::from(Status::aborted("boom")),
            PartitionError::Internal("boom".to_string())
        );
    }

    #[tokio::test]
    async fn status_stream_ends_with_mapped_error() {
        let (mut sink, stream) = sink::channel();
        sink.push_batch(JobBatch::new(Vec::new())).unwrap();
        sink.error(ActivationError::ResourceExhausted {
            job_type: "payment".to_string(),
        });

        let items: Vec<_> = into_status_stream(stream).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let status = items[1].as_ref().unwrap_err();
        assert_eq!(status.code(), Code::ResourceExhausted);
        assert!(status.message().contains("payment"));
    }
}
