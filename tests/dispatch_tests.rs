//! Partition fan-out as seen through the coordinator: truncation repeats,
//! rotation across requests and partial results.


use std::sync::Arc;

use serde_json::json;

use leasegate::cluster::{InMemoryCluster, NotificationBus, PartitionRouter};
use leasegate::config::ClusterConfig;
use leasegate::lease::ActivateJobsRequest;
use test_harness::{collect, test_config, ScriptedRouter, TestGateway};

#[tokio::test(start_paused = true)]
async fn test_truncated_response_repeats_same_partition() {
    let router = Arc::new(ScriptedRouter::new(2));
    router.script_jobs("payment", 1, 2, true);
    router.script_jobs("payment", 1, 1, false);
    let gateway = TestGateway::start(test_config(), router.clone());

    let observed = collect(gateway.activate(ActivateJobsRequest::new("payment", 10))).await;

    assert!(observed.error.is_none());
    assert_eq!(router.called_partitions(), vec![1, 1, 2]);
    let batch_sizes: Vec<usize> = observed.batches.iter().map(Vec::len).collect();
    assert_eq!(batch_sizes, vec![2, 1]);

    let asked: Vec<u32> = router.calls().iter().map(|c| c.max_jobs).collect();
    assert_eq!(asked, vec![10, 8, 7]);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_stops_once_enough_jobs_found() {
    let router = Arc::new(ScriptedRouter::new(3));
    router.script_jobs("payment", 1, 3, false);
    let gateway = TestGateway::start(test_config(), router.clone());

    let observed = collect(gateway.activate(ActivateJobsRequest::new("payment", 3))).await;

    assert_eq!(observed.job_count(), 3);
    assert_eq!(router.called_partitions(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_single_partition_partial_result_completes() {
    let router = Arc::new(ScriptedRouter::new(1));
    router.script_jobs("payment", 1, 3, false);
    let gateway = TestGateway::start(test_config(), router.clone());

    let observed = collect(gateway.activate(ActivateJobsRequest::new("payment", 5))).await;

    // fewer than requested is still a completion, not a park
    assert!(observed.error.is_none());
    assert_eq!(observed.job_count(), 3);
    assert_eq!(router.call_count(), 1);
    let snapshot = gateway.snapshot().await;
    assert_eq!(snapshot.outcomes.completed, 1);
    assert_eq!(snapshot.outcomes.timed_out, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_spreads_start_partition_across_requests() {
    let router = Arc::new(ScriptedRouter::new(3));
    for partition_id in 1..=3 {
        for _ in 0..2 {
            router.script_jobs("payment", partition_id, 1, false);
        }
    }
    let gateway = TestGateway::start(test_config(), router.clone());

    for _ in 0..6 {
        let observed = collect(gateway.activate(ActivateJobsRequest::new("payment", 1))).await;
        assert_eq!(observed.job_count(), 1);
    }

    assert_eq!(router.called_partitions(), vec![1, 2, 3, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_survives_idle_job_type_collection() {
    let router = Arc::new(ScriptedRouter::new(3));
    router.script_jobs("payment", 1, 1, false);
    router.script_jobs("payment", 2, 1, false);
    let gateway = TestGateway::start(test_config(), router.clone());

    collect(gateway.activate(ActivateJobsRequest::new("payment", 1))).await;
    // nothing left for the type, its ledger is gone
    assert!(gateway.snapshot().await.job_type("payment").is_none());

    collect(gateway.activate(ActivateJobsRequest::new("payment", 1))).await;
    assert_eq!(router.called_partitions(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_rotation_is_tracked_per_job_type() {
    let router = Arc::new(ScriptedRouter::new(2));
    router.script_jobs("payment", 1, 1, false);
    router.script_jobs("shipping", 1, 1, false);
    let gateway = TestGateway::start(test_config(), router.clone());

    collect(gateway.activate(ActivateJobsRequest::new("payment", 1))).await;
    collect(gateway.activate(ActivateJobsRequest::new("shipping", 1))).await;

    // both types start their own rotation at partition 1
    assert_eq!(router.called_partitions(), vec![1, 1]);
}

#[tokio::test(start_paused = true)]
async fn test_activation_call_carries_request_parameters() {
    let router = Arc::new(ScriptedRouter::new(1));
    router.script_jobs("payment", 1, 1, false);
    let gateway = TestGateway::start(test_config(), router.clone());

    let request = ActivateJobsRequest::new("payment", 4)
        .with_worker("billing-7")
        .with_lease_timeout(std::time::Duration::from_secs(45))
        .with_fetch_variables(vec!["amount".to_string()]);
    collect(gateway.activate(request)).await;

    let call = &router.calls()[0];
    assert_eq!(call.worker, "billing-7");
    assert_eq!(call.max_jobs, 4);
    assert_eq!(call.lease_timeout, std::time::Duration::from_secs(45));
    assert_eq!(call.fetch_variables, vec!["amount".to_string()]);
}

#[tokio::test]
async fn test_rotation_fairness_over_in_memory_cluster() {
    let bus = NotificationBus::new();
    let cluster = Arc::new(InMemoryCluster::new(&ClusterConfig::new(4), bus.clone()));
    for partition_id in 1..=4 {
        cluster
            .add_jobs(partition_id, "payment", 10, json!({}))
            .await
            .unwrap();
    }
    let gateway = TestGateway::start_with_bus(test_config(), cluster.clone(), bus);

    let attempts = 10usize;
    let mut visits = [0usize; 4];
    for _ in 0..attempts {
        let observed = collect(gateway.activate(ActivateJobsRequest::new("payment", 1))).await;
        let job = &observed.batches[0][0];
        visits[(job.partition_id - 1) as usize] += 1;
    }

    let partitions = cluster.partition_count() as usize;
    let floor = attempts / partitions;
    assert!(
        visits.iter().all(|&v| v == floor || v == floor + 1),
        "uneven visits {:?}",
        visits
    );
}
