use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cluster::{
    ActivatedJob, ActivationCall, NotificationBus, PartitionBatch, PartitionId, PartitionRouter,
    JOBS_AVAILABLE_TOPIC,
};
use crate::config::ClusterConfig;
use crate::error::PartitionError;

const DEFAULT_RETRIES: i32 = 3;

#[derive(Debug, Clone)]
struct StoredJob {
    key: i64,
    retries: i32,
    variables: Value,
}

#[derive(Debug, Default)]
struct PartitionBacklog {
    jobs: HashMap<String, VecDeque<StoredJob>>,
    /// Returned instead of a batch while set.
    fault: Option<PartitionError>,
}

/// A partitioned job backlog held in memory.
///
/// Each partition keeps a FIFO of activatable jobs per job type. Activation
/// removes jobs from the FIFO; release puts them back at the front.
#[derive(Debug)]
pub struct InMemoryCluster {
    partitions: Vec<Mutex<PartitionBacklog>>,
    max_jobs_per_response: u32,
    next_key: AtomicI64,
    next_partition: AtomicU32,
    notifications: NotificationBus,
}

impl InMemoryCluster {
    pub fn new(config: &ClusterConfig, notifications: NotificationBus) -> Self {
        let partitions = (0..config.partition_count)
            .map(|_| Mutex::new(PartitionBacklog::default()))
            .collect();

        Self {
            partitions,
            max_jobs_per_response: config.max_jobs_per_response.max(1),
            next_key: AtomicI64::new(1),
            next_partition: AtomicU32::new(0),
            notifications,
        }
    }

    fn partition(&self, partition_id: PartitionId) -> Result<&Mutex<PartitionBacklog>, PartitionError> {
        partition_id
            .checked_sub(1)
            .and_then(|index| self.partitions.get(index as usize))
            .ok_or_else(|| PartitionError::Rejected {
                reason: format!("unknown partition {}", partition_id),
            })
    }

    /// Create `count` jobs of a type on one partition and announce them.
    pub async fn add_jobs(
        &self,
        partition_id: PartitionId,
        job_type: &str,
        count: usize,
        variables: Value,
    ) -> Result<Vec<i64>, PartitionError> {
        let partition = self.partition(partition_id)?;
        let keys: Vec<i64> = (0..count)
            .map(|_| self.next_key.fetch_add(1, Ordering::Relaxed))
            .collect();

        {
            let mut backlog = partition.lock().await;
            let queue = backlog.jobs.entry(job_type.to_string()).or_default();
            queue.extend(keys.iter().map(|&key| StoredJob {
                key,
                retries: DEFAULT_RETRIES,
                variables: variables.clone(),
            }));
        }

        if !keys.is_empty() {
            self.notifications.publish(JOBS_AVAILABLE_TOPIC, job_type);
            tracing::debug!(partition_id, job_type, count, "Jobs created");
        }
        Ok(keys)
    }

    /// Create a single job, placing jobs on partitions round robin.
    pub async fn add_job(&self, job_type: &str, variables: Value) -> Result<i64, PartitionError> {
        let count = self.partitions.len() as u32;
        if count == 0 {
            return Err(PartitionError::Unavailable(
                "cluster has no partitions".to_string(),
            ));
        }
        let partition_id = self.next_partition.fetch_add(1, Ordering::Relaxed) % count + 1;
        let keys = self.add_jobs(partition_id, job_type, 1, variables).await?;
        keys.into_iter()
            .next()
            .ok_or_else(|| PartitionError::Internal("no job key generated".to_string()))
    }

    /// Activatable jobs of a type across all partitions.
    pub async fn available(&self, job_type: &str) -> usize {
        let mut total = 0;
        for partition in &self.partitions {
            total += partition
                .lock()
                .await
                .jobs
                .get(job_type)
                .map_or(0, VecDeque::len);
        }
        total
    }

    pub async fn available_on(&self, partition_id: PartitionId, job_type: &str) -> usize {
        match self.partition(partition_id) {
            Ok(partition) => partition
                .lock()
                .await
                .jobs
                .get(job_type)
                .map_or(0, VecDeque::len),
            Err(_) => 0,
        }
    }

    /// Make a partition answer every activation with `fault` until cleared
    /// with `None`.
    pub async fn set_fault(
        &self,
        partition_id: PartitionId,
        fault: Option<PartitionError>,
    ) -> Result<(), PartitionError> {
        self.partition(partition_id)?.lock().await.fault = fault;
        Ok(())
    }
}

fn select_variables(variables: &Value, fetch: &[String]) -> Value {
    match variables {
        Value::Object(map) if !fetch.is_empty() => Value::Object(
            map.iter()
                .filter(|(name, _)| fetch.iter().any(|wanted| wanted == *name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[tonic::async_trait]
impl PartitionRouter for InMemoryCluster {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn activate(&self, call: ActivationCall) -> Result<PartitionBatch, PartitionError> {
        let partition = self.partition(call.partition_id)?;
        let mut backlog = partition.lock().await;

        if let Some(fault) = &backlog.fault {
            return Err(fault.clone());
        }

        let Some(queue) = backlog.jobs.get_mut(&call.job_type) else {
            return Ok(PartitionBatch::empty());
        };

        let limit = call.max_jobs.min(self.max_jobs_per_response) as usize;
        let take = limit.min(queue.len());
        let lease = chrono::Duration::from_std(call.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = Utc::now() + lease;

        let jobs: Vec<ActivatedJob> = queue
            .drain(..take)
            .map(|job| ActivatedJob {
                key: job.key,
                job_type: call.job_type.clone(),
                partition_id: call.partition_id,
                worker: call.worker.clone(),
                retries: job.retries,
                deadline,
                variables: select_variables(&job.variables, &call.fetch_variables),
            })
            .collect();

        let capped = take == self.max_jobs_per_response as usize
            && call.max_jobs > self.max_jobs_per_response;
        let truncated = capped && !queue.is_empty();

        tracing::trace!(
            partition_id = call.partition_id,
            job_type = %call.job_type,
            activated = jobs.len(),
            truncated,
            "Activated jobs"
        );
        Ok(PartitionBatch::new(jobs, truncated))
    }

    async fn release(
        &self,
        partition_id: PartitionId,
        jobs: Vec<ActivatedJob>,
    ) -> Result<(), PartitionError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let partition = self.partition(partition_id)?;
        let mut job_types = Vec::new();

        {
            let mut backlog = partition.lock().await;
            for job in jobs.into_iter().rev() {
                if !job_types.contains(&job.job_type) {
                    job_types.push(job.job_type.clone());
                }
                backlog
                    .jobs
                    .entry(job.job_type)
                    .or_default()
                    .push_front(StoredJob {
                        key: job.key,
                        retries: job.retries,
                        variables: job.variables,
                    });
            }
        }

        for job_type in job_types {
            self.notifications.publish(JOBS_AVAILABLE_TOPIC, &job_type);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn call(partition_id: PartitionId, max_jobs: u32) -> ActivationCall {
        ActivationCall {
            partition_id,
            job_type: "payment".to_string(),
            worker: "worker-1".to_string(),
            max_jobs,
            lease_timeout: Duration::from_secs(30),
            fetch_variables: Vec::new(),
        }
    }

    fn cluster(partitions: u32, per_response: u32) -> InMemoryCluster {
        InMemoryCluster::new(
            &ClusterConfig::new(partitions).with_max_jobs_per_response(per_response),
            NotificationBus::new(),
        )
    }

    #[tokio::test]
    async fn activates_up_to_requested_count() {
        let cluster = cluster(2, 32);
        cluster.add_jobs(1, "payment", 5, json!({})).await.unwrap();

        let batch = cluster.activate(call(1, 3)).await.unwrap();
        assert_eq!(batch.jobs.len(), 3);
        assert!(!batch.truncated);
        assert!(batch.jobs.iter().all(|j| j.partition_id == 1));
        assert!(batch.jobs.iter().all(|j| j.worker == "worker-1"));
        assert_eq!(cluster.available_on(1, "payment").await, 2);

        let other = cluster.activate(call(2, 3)).await.unwrap();
        assert!(other.jobs.is_empty());
    }

    #[tokio::test]
    async fn flags_truncated_when_response_cap_hit() {
        let cluster = cluster(1, 2);
        cluster.add_jobs(1, "payment", 5, json!({})).await.unwrap();

        let batch = cluster.activate(call(1, 10)).await.unwrap();
        assert_eq!(batch.jobs.len(), 2);
        assert!(batch.truncated);

        // exactly the requested amount is not a truncation
        let batch = cluster.activate(call(1, 2)).await.unwrap();
        assert_eq!(batch.jobs.len(), 2);
        assert!(!batch.truncated);

        let batch = cluster.activate(call(1, 10)).await.unwrap();
        assert_eq!(batch.jobs.len(), 1);
        assert!(!batch.truncated);
    }

    #[tokio::test]
    async fn fault_is_returned_until_cleared() {
        let cluster = cluster(1, 32);
        cluster.add_jobs(1, "payment", 1, json!({})).await.unwrap();
        cluster
            .set_fault(
                1,
                Some(PartitionError::ResourceExhausted("backpressure".to_string())),
            )
            .await
            .unwrap();

        let err = cluster.activate(call(1, 1)).await.unwrap_err();
        assert!(err.is_resource_exhausted());

        cluster.set_fault(1, None).await.unwrap();
        assert_eq!(cluster.activate(call(1, 1)).await.unwrap().jobs.len(), 1);
    }

    #[tokio::test]
    async fn unknown_partition_is_rejected() {
        let cluster = cluster(1, 32);
        let err = cluster.activate(call(7, 1)).await.unwrap_err();
        assert!(err.is_rejection());
        let err = cluster.activate(call(0, 1)).await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn release_makes_jobs_activatable_again_in_order() {
        let cluster = cluster(1, 32);
        let keys = cluster.add_jobs(1, "payment", 3, json!({})).await.unwrap();

        let batch = cluster.activate(call(1, 2)).await.unwrap();
        cluster.release(1, batch.jobs).await.unwrap();
        assert_eq!(cluster.available("payment").await, 3);

        let batch = cluster.activate(call(1, 3)).await.unwrap();
        let activated: Vec<i64> = batch.jobs.iter().map(|j| j.key).collect();
        assert_eq!(activated, keys);
    }

    #[tokio::test]
    async fn add_job_spreads_across_partitions() {
        let cluster = cluster(3, 32);
        for _ in 0..6 {
            cluster.add_job("payment", json!({})).await.unwrap();
        }
        for partition_id in 1..=3 {
            assert_eq!(cluster.available_on(partition_id, "payment").await, 2);
        }
    }

    #[tokio::test]
    async fn adding_jobs_publishes_notification() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe(JOBS_AVAILABLE_TOPIC);
        let cluster = InMemoryCluster::new(&ClusterConfig::new(1), bus);

        cluster.add_jobs(1, "payment", 2, json!({})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "payment");
    }

    #[tokio::test]
    async fn fetch_variables_limits_payload() {
        let cluster = cluster(1, 32);
        cluster
            .add_jobs(1, "payment", 1, json!({"amount": 10, "currency": "EUR"}))
            .await
            .unwrap();

        let mut request = call(1, 1);
        request.fetch_variables = vec!["amount".to_string()];
        let batch = cluster.activate(request).await.unwrap();
        assert_eq!(batch.jobs[0].variables, json!({"amount": 10}));
    }
}
