use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing_subscriber::EnvFilter;

use leasegate::cluster::{InMemoryCluster, NotificationBus};
use leasegate::config::{ClusterConfig, LongPollConfig};
use leasegate::grpc::into_status_stream;
use leasegate::lease::ActivateJobsRequest;
use leasegate::longpoll::{self, CoordinatorSnapshot, LongPollHandle};
use leasegate::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "leasegate")]
#[command(version)]
#[command(about = "Long polling job activation over a partitioned backlog")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run producers and long polling workers against an in-memory cluster
    Simulate(SimulateArgs),
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Number of partitions
    #[arg(long, default_value = "3")]
    partitions: u32,

    /// Job type produced and activated
    #[arg(long, default_value = "demo")]
    job_type: String,

    /// Total jobs to produce
    #[arg(long, default_value = "100")]
    jobs: usize,

    /// Number of concurrent workers
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Max jobs a worker activates per request
    #[arg(long, default_value = "10")]
    max_jobs: i32,

    /// Mean delay between produced jobs; each delay is jittered
    #[arg(long, default_value = "20")]
    produce_interval_ms: u64,

    /// Per-request long polling timeout. 0 uses the coordinator default,
    /// negative disables long polling for the request.
    #[arg(long, allow_hyphen_values = true)]
    request_timeout_ms: Option<i64>,

    /// Default long polling timeout
    #[arg(long, default_value = "10000")]
    long_poll_timeout_ms: u64,

    /// Probe interval
    #[arg(long, default_value = "10000")]
    probe_timeout_ms: u64,

    /// Empty passes before new requests of a type are parked right away
    #[arg(long, default_value = "3")]
    min_empty_responses: u32,

    /// Cap on jobs per partition response
    #[arg(long, default_value = "32")]
    max_jobs_per_response: u32,

    /// Answer every request after a single pass over the partitions
    #[arg(long)]
    no_long_polling: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct WorkerOutput {
    worker: String,
    requests: usize,
    activated: usize,
}

#[derive(Serialize)]
struct SimulationOutput {
    started_at: DateTime<Utc>,
    elapsed_ms: i64,
    partitions: u32,
    job_type: String,
    jobs_created: usize,
    jobs_activated: usize,
    workers: Vec<WorkerOutput>,
    coordinator: CoordinatorSnapshot,
}

async fn produce(
    cluster: Arc<InMemoryCluster>,
    job_type: String,
    jobs: usize,
    interval_ms: u64,
    done: CancellationToken,
) -> usize {
    let mut created = 0;
    for sequence in 0..jobs {
        let delay = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0..=interval_ms.saturating_mul(2))
        };
        tokio::select! {
            _ = done.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }

        match cluster
            .add_job(&job_type, serde_json::json!({ "sequence": sequence }))
            .await
        {
            Ok(_) => created += 1,
            Err(e) => tracing::warn!(error = %e, "Failed to create job"),
        }
    }
    tracing::info!(job_type = %job_type, created, "Producer finished");
    created
}

async fn work(
    handle: LongPollHandle,
    request: ActivateJobsRequest,
    target: usize,
    activated: Arc<AtomicUsize>,
    done: CancellationToken,
) -> WorkerOutput {
    let mut output = WorkerOutput {
        worker: request.worker.clone(),
        requests: 0,
        activated: 0,
    };

    while !done.is_cancelled() {
        output.requests += 1;
        let mut stream = into_status_stream(handle.activate_jobs(request.clone()));
        let mut received = 0;

        loop {
            let item = tokio::select! {
                _ = done.cancelled() => break,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(batch)) => {
                    received += batch.len();
                    output.activated += batch.len();
                    let total = activated.fetch_add(batch.len(), Ordering::SeqCst) + batch.len();
                    tracing::debug!(worker = %output.worker, jobs = batch.len(), total, "Activated jobs");
                    if total >= target {
                        done.cancel();
                    }
                }
                Some(Err(status)) => {
                    tracing::warn!(
                        worker = %output.worker,
                        code = ?status.code(),
                        message = status.message(),
                        "Activation failed"
                    );
                    match status.code() {
                        Code::Unavailable => done.cancel(),
                        _ => tokio::time::sleep(Duration::from_millis(100)).await,
                    }
                    break;
                }
                None => {
                    if received == 0 {
                        // empty completion, only seen without long polling
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    break;
                }
            }
        }
    }

    output
}

fn print_table(output: &SimulationOutput) {
    println!("Simulation of '{}' over {} partitions", output.job_type, output.partitions);
    println!("{}", "-".repeat(48));
    println!("{:<24} {}", "Started:", output.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("{:<24} {}ms", "Elapsed:", output.elapsed_ms);
    println!("{:<24} {}", "Jobs created:", output.jobs_created);
    println!("{:<24} {}", "Jobs activated:", output.jobs_activated);
    println!();
    println!("{:<16} {:>10} {:>10}", "WORKER", "REQUESTS", "ACTIVATED");
    for worker in &output.workers {
        println!(
            "{:<16} {:>10} {:>10}",
            worker.worker, worker.requests, worker.activated
        );
    }
    println!();

    let outcomes = &output.coordinator.outcomes;
    println!("{:<24} {}", "Requests completed:", outcomes.completed);
    println!("{:<24} {}", "Requests timed out:", outcomes.timed_out);
    println!("{:<24} {}", "Requests aborted:", outcomes.aborted);
    println!("{:<24} {}", "Requests canceled:", outcomes.canceled);
    for job_type in &output.coordinator.job_types {
        println!(
            "{:<24} pending={} active={} failed_attempts={}",
            format!("Type '{}':", job_type.job_type),
            job_type.pending,
            job_type.active,
            job_type.failed_attempts
        );
    }
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cluster_config =
        ClusterConfig::new(args.partitions).with_max_jobs_per_response(args.max_jobs_per_response);
    cluster_config.validate()?;

    let mut long_poll = if args.no_long_polling {
        LongPollConfig::disabled()
    } else {
        LongPollConfig::default()
    };
    long_poll = long_poll
        .with_timeout(Duration::from_millis(args.long_poll_timeout_ms))
        .with_probe_timeout(Duration::from_millis(args.probe_timeout_ms))
        .with_min_empty_responses(args.min_empty_responses);

    let bus = NotificationBus::new();
    let cluster = Arc::new(InMemoryCluster::new(&cluster_config, bus.clone()));
    let shutdown = install_shutdown_handler();
    let (handle, coordinator) = longpoll::spawn(long_poll, cluster.clone(), &bus, shutdown.clone())?;

    let started_at = Utc::now();
    let done = shutdown.child_token();
    let activated = Arc::new(AtomicUsize::new(0));

    tracing::info!(
        partitions = args.partitions,
        job_type = %args.job_type,
        jobs = args.jobs,
        workers = args.workers,
        "Starting simulation"
    );

    let producer = tokio::spawn(produce(
        cluster.clone(),
        args.job_type.clone(),
        args.jobs,
        args.produce_interval_ms,
        done.clone(),
    ));

    let mut workers = Vec::with_capacity(args.workers);
    for index in 0..args.workers {
        let mut request = ActivateJobsRequest::new(args.job_type.clone(), args.max_jobs)
            .with_worker(format!("worker-{}", index + 1));
        if let Some(timeout_ms) = args.request_timeout_ms {
            request = request.with_request_timeout_ms(timeout_ms);
        }
        workers.push(tokio::spawn(work(
            handle.clone(),
            request,
            args.jobs,
            activated.clone(),
            done.clone(),
        )));
    }

    if args.jobs == 0 || args.workers == 0 {
        done.cancel();
    }

    let mut worker_outputs = Vec::with_capacity(workers.len());
    for worker in workers {
        worker_outputs.push(worker.await?);
    }
    let jobs_created = producer.await?;

    let snapshot = handle.snapshot().await?;
    shutdown.cancel();
    coordinator.await?;

    let output = SimulationOutput {
        started_at,
        elapsed_ms: (Utc::now() - started_at).num_milliseconds(),
        partitions: args.partitions,
        job_type: args.job_type,
        jobs_created,
        jobs_activated: activated.load(Ordering::SeqCst),
        workers: worker_outputs,
        coordinator: snapshot,
    };

    match args.output {
        OutputFormat::Table => print_table(&output),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Simulate(simulate_args) => run_simulation(simulate_args).await?,
    }

    Ok(())
}
