//! Entry point for starting, inspecting and controlling jobs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cleanup::{self, CleanupScheduler, DeleteSkippedJobs, KeepLastJobs, StopDeadJobs};
use crate::clock::{Clock, SystemClock};
use crate::config::JobsConfig;
use crate::definition::{JobDefinition, JobMutexGroups};
use crate::error::JobsError;
use crate::events::{JobEventSink, NoopEventSink};
use crate::lock::JobLockRepository;
use crate::runner::{JobRunnable, JobRunner, PING_PERIOD};
use crate::status::{CalculatorRegistry, JobStatusIndicator, StatusDetail};
use crate::store::JobRepository;
use crate::types::{JobInfo, SharedJob};

/// Facade over the job store, the lock registry and the runners.
///
/// Construct one per process and share it behind an `Arc`.
pub struct JobService {
    config: JobsConfig,
    repository: Arc<dyn JobRepository>,
    locks: Arc<dyn JobLockRepository>,
    sink: Arc<dyn JobEventSink>,
    clock: Arc<dyn Clock>,
    runnables: BTreeMap<String, Arc<dyn JobRunnable>>,
    mutex_groups: JobMutexGroups,
    workers: Arc<Semaphore>,
    ping_period: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobService {
    /// Create a service running `runnables`.
    ///
    /// Fails with [`JobsError::Config`] if two runnables share a job type.
    pub fn new(
        config: JobsConfig,
        repository: Arc<dyn JobRepository>,
        locks: Arc<dyn JobLockRepository>,
        runnables: Vec<Arc<dyn JobRunnable>>,
    ) -> Result<Self, JobsError> {
        let mut by_type = BTreeMap::new();
        for runnable in runnables {
            let job_type = runnable.definition().job_type.clone();
            if by_type.insert(job_type.clone(), runnable).is_some() {
                return Err(JobsError::Config(format!(
                    "job type '{}' is registered twice",
                    job_type
                )));
            }
        }

        let mutex_groups = config.mutex_groups();
        let workers = Arc::new(Semaphore::new(config.thread_count.max(1)));
        Ok(Self {
            config,
            repository,
            locks,
            sink: Arc::new(NoopEventSink),
            clock: Arc::new(SystemClock),
            runnables: by_type,
            mutex_groups,
            workers,
            ping_period: PING_PERIOD,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn JobEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Start a job of `job_type` in the background and return its id.
    ///
    /// Returns once the new job has been persisted. Fails with
    /// [`JobsError::JobBlocked`] if the type is disabled or a job of the same
    /// type or mutex group is running.
    #[tracing::instrument(skip(self))]
    pub async fn start_async_job(&self, job_type: &str) -> Result<String, JobsError> {
        let (id, _done) = self.start(job_type).await?;
        Ok(id)
    }

    async fn start(
        &self,
        job_type: &str,
    ) -> Result<(String, oneshot::Receiver<JobInfo>), JobsError> {
        let runnable = self
            .runnables
            .get(job_type)
            .cloned()
            .ok_or_else(|| JobsError::NotFound(format!("job type '{}'", job_type)))?;

        let id = Uuid::new_v4().to_string();
        let mutex_group = self.mutex_groups.mutex_job_types_for(job_type);
        self.locks
            .mark_running_if_possible(job_type, &id, &mutex_group)
            .await?;

        let job = SharedJob::new(
            JobInfo::new(&id, job_type, &self.config.hostname, self.clock.now()),
            self.clock.clone(),
        );
        let runner = match JobRunner::create(
            job,
            self.repository.clone(),
            self.locks.clone(),
            self.sink.clone(),
        )
        .await
        {
            Ok(runner) => runner.with_ping_period(self.ping_period),
            Err(e) => {
                if let Err(clear) = self.locks.clear_running_if(job_type, &id).await {
                    error!(error = %clear, "failed to release lock of unstarted job");
                }
                return Err(e);
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let workers = self.workers.clone();
        let handle = tokio::spawn(async move {
            // Pings start before the wait for a worker, so a queued job is not taken for dead
            let permit = async move { workers.acquire_owned().await.ok() };
            let final_state = runner.run_when_ready(runnable, permit).await;
            let _ = done_tx.send(final_state);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);

        info!(job_id = %id, "started job");
        Ok((id, done_rx))
    }

    /// Wait for every job started so far to finish.
    pub async fn wait_for_jobs(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "job task failed");
            }
        }
    }

    pub async fn find_job(&self, id: &str) -> Result<Option<JobInfo>, JobsError> {
        self.repository.find_one(id).await
    }

    /// The newest `count` jobs, optionally of one type only.
    pub async fn find_jobs(
        &self,
        job_type: Option<&str>,
        count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        match job_type {
            Some(job_type) => self.repository.find_latest_by(job_type, count).await,
            None => self.repository.find_latest(count).await,
        }
    }

    /// The newest job of every type.
    pub async fn find_jobs_distinct(&self) -> Result<Vec<JobInfo>, JobsError> {
        self.repository.find_latest_distinct().await
    }

    /// Delete finished jobs, optionally of one type only. Running jobs are kept.
    /// Returns the number of jobs deleted.
    pub async fn delete_jobs(&self, job_type: Option<&str>) -> Result<usize, JobsError> {
        let job_types: Vec<String> = match job_type {
            Some(job_type) => vec![job_type.to_string()],
            None => self
                .repository
                .find_latest_distinct()
                .await?
                .into_iter()
                .map(|job| job.job_type)
                .collect(),
        };

        let mut deleted = 0;
        for job_type in job_types {
            for job in self.repository.find_by_type(&job_type).await? {
                if job.is_stopped() {
                    self.repository.remove_if_stopped(&job.id).await?;
                    deleted += 1;
                }
            }
        }
        info!(deleted, job_type = job_type.unwrap_or("*"), "deleted jobs");
        Ok(deleted)
    }

    /// Definitions of every registered job, ordered by job type.
    pub fn job_definitions(&self) -> Vec<JobDefinition> {
        self.runnables
            .values()
            .map(|runnable| runnable.definition().clone())
            .collect()
    }

    pub fn job_definition(&self, job_type: &str) -> Option<&JobDefinition> {
        self.runnables.get(job_type).map(|r| r.definition())
    }

    /// Job type to id of the job currently running it.
    pub async fn running_jobs(&self) -> Result<BTreeMap<String, String>, JobsError> {
        self.locks.running_jobs().await
    }

    #[tracing::instrument(skip(self))]
    pub async fn disable_job_type(
        &self,
        job_type: &str,
        comment: Option<&str>,
    ) -> Result<(), JobsError> {
        self.locks.disable(job_type, comment).await?;
        info!("disabled job type");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn enable_job_type(&self, job_type: &str) -> Result<(), JobsError> {
        self.locks.enable(job_type).await?;
        info!("enabled job type");
        Ok(())
    }

    /// Mark running jobs without an update for more than `seconds` as dead.
    pub async fn kill_jobs_dead_since(&self, seconds: u64) -> Result<Vec<JobInfo>, JobsError> {
        let silence = chrono::Duration::try_seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
            .ok_or_else(|| JobsError::InvalidInput(format!("{} seconds is out of range", seconds)))?;
        let now = self.clock.now();
        cleanup::kill_jobs_dead_since(
            self.repository.as_ref(),
            self.locks.as_ref(),
            now - silence,
            now,
        )
        .await
    }

    /// Cleanup strategies configured for this service.
    pub fn cleanup_scheduler(&self) -> CleanupScheduler {
        let cleanup = &self.config.cleanup;
        CleanupScheduler::new()
            .with_strategy(
                Arc::new(StopDeadJobs::new(
                    self.repository.clone(),
                    self.locks.clone(),
                    self.clock.clone(),
                    cleanup.mark_dead_after,
                )),
                cleanup.interval,
            )
            .with_strategy(
                Arc::new(KeepLastJobs::new(
                    self.repository.clone(),
                    cleanup.number_of_jobs_to_keep,
                )),
                cleanup.interval,
            )
            .with_strategy(
                Arc::new(DeleteSkippedJobs::new(
                    self.repository.clone(),
                    cleanup.number_of_skipped_jobs_to_keep,
                )),
                cleanup.interval,
            )
    }

    /// One status indicator per registered job type.
    ///
    /// Fails with [`JobsError::Config`] if a configured calculator is unknown.
    pub fn status_indicators(
        &self,
        registry: &CalculatorRegistry,
    ) -> Result<Vec<JobStatusIndicator>, JobsError> {
        self.runnables
            .values()
            .map(|runnable| {
                let definition = runnable.definition().clone();
                let calculator = registry
                    .for_job_type(&definition.job_type, &self.config.status.calculator)?
                    .clone();
                Ok(JobStatusIndicator::new(
                    definition,
                    calculator,
                    self.repository.clone(),
                    self.locks.clone(),
                    self.clock.clone(),
                ))
            })
            .collect()
    }

    /// Current status of every registered job type.
    pub async fn status_details(
        &self,
        registry: &CalculatorRegistry,
    ) -> Result<Vec<StatusDetail>, JobsError> {
        let indicators = self.status_indicators(registry)?;
        Ok(join_all(indicators.iter().map(|i| i.status_detail())).await)
    }

    /// Start every job with a fixed delay, then again `fixed_delay` after
    /// each run ends, until `shutdown` turns true.
    pub async fn run_fixed_delay_triggers(&self, shutdown: watch::Receiver<bool>) {
        let triggers = self.runnables.values().filter_map(|runnable| {
            let definition = runnable.definition();
            definition
                .fixed_delay
                .map(|delay| self.trigger_loop(&definition.job_type, delay, shutdown.clone()))
        });
        join_all(triggers).await;
    }

    async fn trigger_loop(&self, job_type: &str, delay: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(job_type, ?delay, "scheduling job with fixed delay");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.start(job_type).await {
                Ok((_, done)) => {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = done => {}
                    }
                }
                Err(e) if e.is_blocked() => debug!(job_type, error = %e, "job not started"),
                Err(e) => warn!(job_type, error = %e, "failed to start job"),
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(delay) => {}
            }
        }
        debug!(job_type, "fixed delay trigger stopped");
    }
}
