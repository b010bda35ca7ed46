//! Long polling of job activation requests.
//!
//! A request that finds no jobs is parked per job type until jobs are
//! announced, a probe retries it, or its timeout elapses. All state is owned
//! by a single [`LongPollCoordinator`] task.

pub mod coordinator;
pub mod handle;
pub mod ledger;
pub mod timer;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{NotificationBus, PartitionRouter, JOBS_AVAILABLE_TOPIC};
use crate::config::LongPollConfig;
use crate::error::Result;

pub use coordinator::{CoordinatorMessage, CoordinatorSnapshot, JobTypeSnapshot, LongPollCoordinator};
pub use handle::LongPollHandle;
pub use ledger::{LeaseOutcomes, TypeDispatchLedger};

/// Start a coordinator on the current runtime, subscribed to the
/// "jobs available" topic of `bus`.
pub fn spawn(
    config: LongPollConfig,
    router: Arc<dyn PartitionRouter>,
    bus: &NotificationBus,
    shutdown: CancellationToken,
) -> Result<(LongPollHandle, JoinHandle<()>)> {
    let (coordinator, message_rx) = LongPollCoordinator::new(config, router)?;
    let handle = coordinator.handle();
    let notifications = bus.subscribe(JOBS_AVAILABLE_TOPIC);
    let task = tokio::spawn(coordinator.run(message_rx, notifications, shutdown));
    Ok((handle, task))
}
