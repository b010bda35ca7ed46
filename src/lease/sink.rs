use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cluster::ActivatedJob;
use crate::error::ActivationError;

/// Jobs pushed to a client in one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobBatch {
    pub jobs: Vec<ActivatedJob>,
}

impl JobBatch {
    pub fn new(jobs: Vec<ActivatedJob>) -> Self {
        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub type ActivationItem = Result<JobBatch, ActivationError>;

/// What the caller of `activate_jobs` sees: zero or more batches, then the
/// end of the stream (completion) or a single error item.
pub type ActivateJobsStream = UnboundedReceiverStream<ActivationItem>;

/// Create a connected sink/stream pair.
pub fn channel() -> (ResponseSink, ActivateJobsStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResponseSink { tx: Some(tx) }, UnboundedReceiverStream::new(rx))
}

/// Push side of a client's activation stream.
///
/// Pushing never blocks. Completion drops the sender, which ends the stream.
/// A sink dropped without a terminal signal reports `Unavailable`, so a lost
/// request never reads as an empty completion.
#[derive(Debug)]
pub struct ResponseSink {
    tx: Option<mpsc::UnboundedSender<ActivationItem>>,
}

impl ResponseSink {
    /// Push a non-terminal batch. Hands the batch back if the client is gone.
    pub fn push_batch(&self, batch: JobBatch) -> Result<(), JobBatch> {
        let Some(tx) = &self.tx else {
            return Err(batch);
        };
        match tx.send(Ok(batch)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(Ok(batch))) => Err(batch),
            Err(mpsc::error::SendError(Err(_))) => Err(JobBatch::default()),
        }
    }

    pub fn complete(&mut self) {
        self.tx.take();
    }

    pub fn error(&mut self, err: ActivationError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err));
        }
    }

    /// True once the receiving side was dropped (client disconnected).
    pub fn is_canceled(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// True once a terminal signal was sent.
    pub fn is_terminated(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for ResponseSink {
    fn drop(&mut self) {
        self.error(ActivationError::Unavailable(
            "request was dropped before it was answered".to_string(),
        ));
    }
}
