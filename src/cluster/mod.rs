//! Boundary to the partitioned cluster.
//!
//! The long polling core never talks to partitions directly. It goes through:
//! - [`PartitionRouter`]: topology size, job activation and release per partition
//! - [`NotificationBus`]: fire-and-forget "jobs available" signals per job type
//!
//! [`memory::InMemoryCluster`] implements both sides for local runs and tests.

pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::PartitionError;

pub use memory::InMemoryCluster;

/// Topic on which partitions announce that jobs of a type became activatable.
pub const JOBS_AVAILABLE_TOPIC: &str = "jobsAvailable";

const NOTIFICATION_CAPACITY: usize = 1024;

pub type PartitionId = u32;

/// A job leased to a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivatedJob {
    pub key: i64,
    pub job_type: String,
    pub partition_id: PartitionId,
    pub worker: String,
    pub retries: i32,
    pub deadline: DateTime<Utc>,
    pub variables: serde_json::Value,
}

/// One activation command sent to a single partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationCall {
    pub partition_id: PartitionId,
    pub job_type: String,
    pub worker: String,
    pub max_jobs: u32,
    pub lease_timeout: Duration,
    pub fetch_variables: Vec<String>,
}

/// Jobs returned by one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionBatch {
    pub jobs: Vec<ActivatedJob>,
    /// The partition had more activatable jobs than fit in this response.
    pub truncated: bool,
}

impl PartitionBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(jobs: Vec<ActivatedJob>, truncated: bool) -> Self {
        Self { jobs, truncated }
    }
}

/// Routes activation commands to the leader of a partition.
#[tonic::async_trait]
pub trait PartitionRouter: Send + Sync + 'static {
    /// Number of partitions in the current topology. Partition ids run from
    /// 1 to this count inclusive.
    fn partition_count(&self) -> u32;

    async fn activate(&self, call: ActivationCall) -> Result<PartitionBatch, PartitionError>;

    /// Hands activated jobs back to their partition so they can be activated
    /// again without waiting for the lease deadline.
    async fn release(
        &self,
        partition_id: PartitionId,
        jobs: Vec<ActivatedJob>,
    ) -> Result<(), PartitionError>;
}

/// Topic based broadcast of job type names.
///
/// Delivery is best effort: publishing without subscribers drops the event,
/// and slow subscribers may lag and miss events.
#[derive(Debug, Clone, Default)]
pub struct NotificationBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFICATION_CAPACITY).0)
            .clone()
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }

    /// Publish a job type on a topic. Returns the number of subscribers that
    /// received it.
    pub fn publish(&self, topic: &str, job_type: &str) -> usize {
        self.sender(topic).send(job_type.to_string()).unwrap_or(0)
    }
}
