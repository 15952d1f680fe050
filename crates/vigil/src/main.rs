//! Vigil: background job daemon
//!
//! Main binary with subcommands:
//! - `daemon`: Run the demo jobs on their schedules, with cleanup and status logging
//! - `status`: Print the latest job of every type and the health of each job type
//! - `disable` / `enable`: Stop or allow new runs of a job type

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_jobs::{
    BroadcastEventSink, CalculatorRegistry, CleanupConfig, InMemJobLockRepository,
    InMemJobRepository, JobLockRepository, JobRepository, JobService, JobsConfig,
    SqliteJobLockRepository, SqliteJobRepository, StatusConfig, aggregate_status,
};

mod jobs;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Background job daemon", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// SQLite database for jobs and locks. Without it, everything is kept in memory.
    #[arg(long, global = true, env = "VIGIL_SQLITE")]
    sqlite: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon {
        /// Jobs executing at the same time
        #[arg(long, env = "VIGIL_THREAD_COUNT", default_value = "10")]
        thread_count: usize,

        /// Hostname recorded on started jobs
        #[arg(long, env = "VIGIL_HOSTNAME")]
        hostname: Option<String>,

        /// Finished jobs kept per job type
        #[arg(long, env = "VIGIL_JOBS_TO_KEEP", default_value = "100")]
        jobs_to_keep: usize,

        /// Skipped jobs kept per job type
        #[arg(long, env = "VIGIL_SKIPPED_JOBS_TO_KEEP", default_value = "10")]
        skipped_jobs_to_keep: usize,

        /// Seconds without a ping after which a running job is marked dead
        #[arg(long, env = "VIGIL_MARK_DEAD_AFTER", default_value = "30")]
        mark_dead_after: u64,

        /// Seconds between cleanup sweeps
        #[arg(long, env = "VIGIL_CLEANUP_INTERVAL", default_value = "10")]
        cleanup_interval: u64,

        /// Seconds between status log lines
        #[arg(long, env = "VIGIL_STATUS_INTERVAL", default_value = "60")]
        status_interval: u64,

        /// Status calculator per job type, as `type=calculator`
        #[arg(long = "calculator", env = "VIGIL_STATUS_CALCULATOR", value_delimiter = ',')]
        calculators: Vec<String>,

        /// Milliseconds per unit of demo work
        #[arg(long, env = "VIGIL_DEMO_STEP_MS", default_value = "1000")]
        step_ms: u64,

        /// Seconds to wait for running jobs on shutdown
        #[arg(long, default_value = "30")]
        shutdown_grace: u64,
    },

    /// Show the latest job of every type and the status of each job type
    Status,

    /// Prevent new runs of a job type
    Disable {
        job_type: String,

        /// Reason shown in the job type's status
        #[arg(long)]
        comment: Option<String>,
    },

    /// Allow new runs of a disabled job type
    Enable { job_type: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vigil=info,vigil_jobs=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let (repository, locks) = open_store(&cli.store)?;

    match cli.command {
        Commands::Daemon {
            thread_count,
            hostname,
            jobs_to_keep,
            skipped_jobs_to_keep,
            mark_dead_after,
            cleanup_interval,
            status_interval,
            calculators,
            step_ms,
            shutdown_grace,
        } => {
            let mut config = JobsConfig {
                thread_count,
                cleanup: CleanupConfig {
                    number_of_jobs_to_keep: jobs_to_keep,
                    number_of_skipped_jobs_to_keep: skipped_jobs_to_keep,
                    mark_dead_after: Duration::from_secs(mark_dead_after),
                    interval: Duration::from_secs(cleanup_interval),
                },
                status: StatusConfig {
                    calculator: parse_calculators(&calculators)?,
                },
                mutex_groups: jobs::mutex_groups(),
                ..JobsConfig::default()
            };
            if let Some(hostname) = hostname {
                config.hostname = hostname;
            }

            run_daemon(
                config,
                repository,
                locks,
                Duration::from_millis(step_ms),
                Duration::from_secs(status_interval),
                Duration::from_secs(shutdown_grace),
            )
            .await
        }

        Commands::Status => {
            let service = service(JobsConfig::default(), repository, locks, Duration::ZERO)?;
            print_status(&service).await
        }

        Commands::Disable { job_type, comment } => {
            locks
                .disable(&job_type, comment.as_deref())
                .await
                .into_diagnostic()?;
            println!("disabled {}", job_type);
            Ok(())
        }

        Commands::Enable { job_type } => {
            locks.enable(&job_type).await.into_diagnostic()?;
            println!("enabled {}", job_type);
            Ok(())
        }
    }
}

fn open_store(
    args: &StoreArgs,
) -> Result<(Arc<dyn JobRepository>, Arc<dyn JobLockRepository>)> {
    match &args.sqlite {
        Some(path) => {
            let repository = SqliteJobRepository::open(path)
                .map_err(|e| miette::miette!("failed to open job store {}: {}", path.display(), e))?;
            let locks = SqliteJobLockRepository::open(path)
                .map_err(|e| miette::miette!("failed to open lock registry {}: {}", path.display(), e))?;
            Ok((Arc::new(repository), Arc::new(locks)))
        }
        None => {
            warn!("===============================================================");
            warn!("Using in-memory job store and lock registry.");
            warn!("Jobs are lost on restart and locks only hold within this process.");
            warn!("Pass --sqlite <path> to persist them.");
            warn!("===============================================================");
            Ok((
                Arc::new(InMemJobRepository::new()),
                Arc::new(InMemJobLockRepository::new()),
            ))
        }
    }
}

/// Parse `type=calculator` pairs.
fn parse_calculators(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(job_type, name)| (job_type.to_string(), name.to_string()))
                .ok_or_else(|| {
                    miette::miette!("invalid calculator '{}', expected type=calculator", pair)
                })
        })
        .collect()
}

fn service(
    config: JobsConfig,
    repository: Arc<dyn JobRepository>,
    locks: Arc<dyn JobLockRepository>,
    step: Duration,
) -> Result<JobService> {
    let config = config
        .validated(&CalculatorRegistry::new())
        .map_err(|e| miette::miette!("{}", e))?;
    JobService::new(config, repository, locks, jobs::all(step)).map_err(|e| miette::miette!("{}", e))
}

async fn run_daemon(
    config: JobsConfig,
    repository: Arc<dyn JobRepository>,
    locks: Arc<dyn JobLockRepository>,
    step: Duration,
    status_interval: Duration,
    shutdown_grace: Duration,
) -> Result<()> {
    let events = Arc::new(BroadcastEventSink::new());
    let service = Arc::new(service(config, repository, locks, step)?.with_event_sink(events.clone()));
    let registry = CalculatorRegistry::new();
    // Fail on unknown calculators before anything starts
    service
        .status_indicators(&registry)
        .map_err(|e| miette::miette!("{}", e))?;

    info!(
        hostname = %service.config().hostname,
        thread_count = service.config().thread_count,
        job_types = service.job_definitions().len(),
        "vigil starting"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    // Log job lifecycle events
    let mut event_rx = events.subscribe();
    let events_handle = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(job_id = %event.job_id, job_type = %event.job_type, event = ?event.kind, "job event");
        }
    });

    let cleanup_handle = tokio::spawn(service.cleanup_scheduler().run(shutdown_rx.clone()));

    let triggers_handle = {
        let service = service.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { service.run_fixed_delay_triggers(shutdown_rx).await })
    };

    let status_handle = {
        let service = service.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(status_interval);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticks.tick() => log_status(&service, &registry).await,
                }
            }
        })
    };

    // Wait for shutdown signal
    let mut main_shutdown_rx = shutdown_rx.clone();
    loop {
        if main_shutdown_rx.changed().await.is_err() || *main_shutdown_rx.borrow() {
            break;
        }
    }

    info!("shutting down");
    let _ = triggers_handle.await;
    let _ = cleanup_handle.await;
    let _ = status_handle.await;

    if tokio::time::timeout(shutdown_grace, service.wait_for_jobs())
        .await
        .is_err()
    {
        let running = service.running_jobs().await.unwrap_or_default();
        warn!(?running, "jobs still running at shutdown");
    }
    events_handle.abort();

    info!("vigil stopped");
    Ok(())
}

async fn log_status(service: &JobService, registry: &CalculatorRegistry) {
    match service.status_details(registry).await {
        Ok(details) => {
            for detail in &details {
                info!(job = %detail.name, status = %detail.status, message = %detail.message, "job status");
            }
            info!(status = %aggregate_status(&details), "overall job status");
        }
        Err(e) => warn!(error = %e, "failed to compute job status"),
    }
}

async fn print_status(service: &JobService) -> Result<()> {
    let latest = service
        .find_jobs_distinct()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Latest jobs:");
    for job in &latest {
        let state = match job.stopped {
            Some(stopped) => format!("{} (stopped {})", job.status, stopped.to_rfc3339()),
            None => "RUNNING".to_string(),
        };
        println!(
            "  {:<10} {} started {} {}",
            job.job_type,
            job.id,
            job.started.to_rfc3339(),
            state
        );
    }

    let running = service
        .running_jobs()
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    if !running.is_empty() {
        println!("Running:");
        for (job_type, id) in &running {
            println!("  {:<10} {}", job_type, id);
        }
    }

    let details = service
        .status_details(&CalculatorRegistry::new())
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("Status: {}", aggregate_status(&details));
    for detail in &details {
        println!("  {:<12} {:<8} {}", detail.name, detail.status, detail.message);
    }
    Ok(())
}
