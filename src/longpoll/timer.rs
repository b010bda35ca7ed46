use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lease::RequestId;
use crate::longpoll::coordinator::CoordinatorMessage;

/// Schedules a `Timeout` message for a parked request. Cancelling the returned
/// token disarms the timer.
pub fn schedule_timeout(
    delay: Duration,
    message_tx: mpsc::UnboundedSender<CoordinatorMessage>,
    job_type: String,
    request_id: RequestId,
) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = cancelled.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                let _ = message_tx.send(CoordinatorMessage::Timeout { job_type, request_id });
            }
        }
    });

    token
}
