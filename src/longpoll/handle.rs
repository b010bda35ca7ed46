use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{ActivationError, LeaseGateError, Result};
use crate::lease::sink::{self, ActivateJobsStream};
use crate::lease::ActivateJobsRequest;
use crate::longpoll::coordinator::{CoordinatorMessage, CoordinatorSnapshot};

/// Cloneable entry point into a running [`LongPollCoordinator`].
///
/// [`LongPollCoordinator`]: crate::longpoll::LongPollCoordinator
#[derive(Debug, Clone)]
pub struct LongPollHandle {
    message_tx: mpsc::UnboundedSender<CoordinatorMessage>,
    next_request_id: Arc<AtomicU64>,
}

impl LongPollHandle {
    pub(crate) fn new(
        message_tx: mpsc::UnboundedSender<CoordinatorMessage>,
        next_request_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            message_tx,
            next_request_id,
        }
    }

    /// Submit an activation request.
    ///
    /// The stream yields zero or more job batches and then ends, or ends with
    /// a single error. Dropping the stream cancels the request.
    pub fn activate_jobs(&self, request: ActivateJobsRequest) -> ActivateJobsStream {
        let (sink, stream) = sink::channel();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let submit = CoordinatorMessage::Submit {
            request_id,
            request,
            sink,
        };
        if let Err(mpsc::error::SendError(CoordinatorMessage::Submit { mut sink, .. })) =
            self.message_tx.send(submit)
        {
            sink.error(ActivationError::Unavailable(
                "long polling coordinator is not running".to_string(),
            ));
        }

        stream
    }

    /// Signal that jobs of a type became available.
    pub fn notify_jobs_available(&self, job_type: &str) {
        let _ = self.message_tx.send(CoordinatorMessage::JobsAvailable {
            job_type: job_type.to_string(),
        });
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(CoordinatorMessage::Snapshot { response_tx })
            .map_err(|_| LeaseGateError::CoordinatorStopped)?;
        response_rx
            .await
            .map_err(|_| LeaseGateError::CoordinatorStopped)
    }

    pub fn is_closed(&self) -> bool {
        self.message_tx.is_closed()
    }
}
