//! Periodic maintenance of the job history.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::JobsError;
use crate::lock::JobLockRepository;
use crate::store::JobRepository;
use crate::types::{JobInfo, JobStatus};

/// One maintenance sweep over the job store.
///
/// Strategies run concurrently with live runners and with each other, so a
/// sweep must never assume it sees a stable snapshot.
#[async_trait]
pub trait JobCleanupStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn do_cleanup(&self) -> Result<(), JobsError>;
}

async fn job_types(repository: &dyn JobRepository) -> Result<BTreeSet<String>, JobsError> {
    Ok(repository
        .find_latest_distinct()
        .await?
        .into_iter()
        .map(|job| job.job_type)
        .collect())
}

/// Delete every record after the first `keep`. Returns how many were removed.
async fn remove_beyond(
    repository: &dyn JobRepository,
    jobs: impl IntoIterator<Item = JobInfo>,
    keep: usize,
) -> Result<usize, JobsError> {
    let mut removed = 0;
    for job in jobs.into_iter().skip(keep) {
        repository.remove_if_stopped(&job.id).await?;
        removed += 1;
    }
    Ok(removed)
}

/// Keep the `n` most recently started finished jobs of each type.
pub struct KeepLastJobs {
    repository: Arc<dyn JobRepository>,
    number_of_jobs_to_keep: usize,
}

impl KeepLastJobs {
    pub fn new(repository: Arc<dyn JobRepository>, number_of_jobs_to_keep: usize) -> Self {
        Self {
            repository,
            number_of_jobs_to_keep,
        }
    }
}

#[async_trait]
impl JobCleanupStrategy for KeepLastJobs {
    fn name(&self) -> &'static str {
        "KeepLastJobs"
    }

    async fn do_cleanup(&self) -> Result<(), JobsError> {
        let mut removed = 0;
        for job_type in job_types(self.repository.as_ref()).await? {
            let stopped = self
                .repository
                .find_by_type(&job_type)
                .await?
                .into_iter()
                .filter(JobInfo::is_stopped);
            removed +=
                remove_beyond(self.repository.as_ref(), stopped, self.number_of_jobs_to_keep)
                    .await?;
        }
        if removed > 0 {
            info!(removed, "deleted old jobs");
        }
        Ok(())
    }
}

/// Keep the `n` most recent skipped jobs of each type.
pub struct DeleteSkippedJobs {
    repository: Arc<dyn JobRepository>,
    number_of_skipped_jobs_to_keep: usize,
}

impl DeleteSkippedJobs {
    pub fn new(repository: Arc<dyn JobRepository>, number_of_skipped_jobs_to_keep: usize) -> Self {
        Self {
            repository,
            number_of_skipped_jobs_to_keep,
        }
    }
}

#[async_trait]
impl JobCleanupStrategy for DeleteSkippedJobs {
    fn name(&self) -> &'static str {
        "DeleteSkippedJobs"
    }

    async fn do_cleanup(&self) -> Result<(), JobsError> {
        let mut removed = 0;
        for job_type in job_types(self.repository.as_ref()).await? {
            let skipped = self
                .repository
                .find_by_type(&job_type)
                .await?
                .into_iter()
                .filter(|job| job.status == JobStatus::Skipped);
            removed += remove_beyond(
                self.repository.as_ref(),
                skipped,
                self.number_of_skipped_jobs_to_keep,
            )
            .await?;
        }
        if removed > 0 {
            info!(removed, "deleted skipped jobs");
        }
        Ok(())
    }
}

/// Mark every running job silent since before `cutoff` as dead and release
/// its lock. Returns the jobs that were marked.
///
/// Each job is re-checked and marked in one atomic store write, so a job that
/// stopped or pinged after the candidate query is left alone.
pub async fn kill_jobs_dead_since(
    repository: &dyn JobRepository,
    locks: &dyn JobLockRepository,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Vec<JobInfo>, JobsError> {
    let silent = repository.find_running_without_update_since(cutoff).await?;
    let mut killed = Vec::with_capacity(silent.len());
    for candidate in silent {
        let Some(job) = repository
            .mark_dead_if_silent(&candidate.id, cutoff, now)
            .await?
        else {
            debug!(job_id = %candidate.id, "job finished or pinged before it could be marked dead");
            continue;
        };
        warn!(job_id = %job.id, job_type = %job.job_type, last_updated = %candidate.last_updated, "marked job as dead");

        // A newer job may already hold the lock
        if !locks.clear_running_if(&job.job_type, &job.id).await? {
            debug!(job_id = %job.id, "lock of dead job already released");
        }
        killed.push(job);
    }
    Ok(killed)
}

/// Mark running jobs without a ping for longer than `mark_dead_after` as dead.
pub struct StopDeadJobs {
    repository: Arc<dyn JobRepository>,
    locks: Arc<dyn JobLockRepository>,
    clock: Arc<dyn Clock>,
    mark_dead_after: Duration,
}

impl StopDeadJobs {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        locks: Arc<dyn JobLockRepository>,
        clock: Arc<dyn Clock>,
        mark_dead_after: Duration,
    ) -> Self {
        Self {
            repository,
            locks,
            clock,
            mark_dead_after,
        }
    }
}

#[async_trait]
impl JobCleanupStrategy for StopDeadJobs {
    fn name(&self) -> &'static str {
        "StopDeadJobs"
    }

    async fn do_cleanup(&self) -> Result<(), JobsError> {
        let silence = chrono::Duration::from_std(self.mark_dead_after)
            .map_err(|e| JobsError::Config(format!("mark_dead_after out of range: {}", e)))?;
        let now = self.clock.now();
        let killed = kill_jobs_dead_since(
            self.repository.as_ref(),
            self.locks.as_ref(),
            now - silence,
            now,
        )
        .await?;
        if !killed.is_empty() {
            info!(count = killed.len(), "stopped dead jobs");
        }
        Ok(())
    }
}

/// Runs each strategy on its own fixed-rate interval until shutdown.
#[derive(Default)]
pub struct CleanupScheduler {
    strategies: Vec<(Arc<dyn JobCleanupStrategy>, Duration)>,
}

impl CleanupScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn JobCleanupStrategy>, every: Duration) -> Self {
        self.strategies.push((strategy, every));
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Run every strategy once, logging failures.
    pub async fn run_once(&self) {
        for (strategy, _) in &self.strategies {
            sweep(strategy.as_ref()).await;
        }
    }

    /// Run until `shutdown` turns true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        info!(strategies = self.strategies.len(), "cleanup scheduler starting");
        let loops = self
            .strategies
            .into_iter()
            .map(|(strategy, every)| run_strategy(strategy, every, shutdown.clone()));
        join_all(loops).await;
        info!("cleanup scheduler stopped");
    }
}

async fn sweep(strategy: &dyn JobCleanupStrategy) {
    debug!(strategy = strategy.name(), "running cleanup");
    if let Err(e) = strategy.do_cleanup().await {
        // Retried on the next tick
        warn!(strategy = strategy.name(), error = %e, "cleanup failed");
    }
}

async fn run_strategy(
    strategy: Arc<dyn JobCleanupStrategy>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticks = interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticks.tick() => sweep(strategy.as_ref()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lock::InMemJobLockRepository;
    use crate::store::InMemJobRepository;
    use crate::types::JOB_DEAD_MESSAGE;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn job(id: &str, job_type: &str, minutes: i64) -> JobInfo {
        JobInfo::new(id, job_type, "host", base_time() + ChronoDuration::minutes(minutes))
    }

    fn stopped(id: &str, job_type: &str, minutes: i64) -> JobInfo {
        let mut job = job(id, job_type, minutes);
        job.stop(job.started + ChronoDuration::seconds(5));
        job
    }

    fn skipped(id: &str, job_type: &str, minutes: i64) -> JobInfo {
        let mut job = job(id, job_type, minutes);
        job.skipped(job.started + ChronoDuration::seconds(5));
        job
    }

    async fn ids_of(repository: &InMemJobRepository, job_type: &str) -> Vec<String> {
        repository
            .find_by_type(job_type)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect()
    }

    // === Unit Tests ===

    #[tokio::test]
    async fn test_keep_last_jobs_per_type() {
        let repository = Arc::new(InMemJobRepository::new());
        for (id, minutes) in [("foo-1", 1), ("foo-2", 2), ("foo-3", 3)] {
            repository
                .create_or_update(stopped(id, "Foo", minutes))
                .await
                .unwrap();
        }
        repository
            .create_or_update(stopped("bar-1", "Bar", 0))
            .await
            .unwrap();

        KeepLastJobs::new(repository.clone(), 2)
            .do_cleanup()
            .await
            .unwrap();

        assert_eq!(ids_of(&repository, "Foo").await, vec!["foo-3", "foo-2"]);
        assert_eq!(ids_of(&repository, "Bar").await, vec!["bar-1"]);
    }

    #[tokio::test]
    async fn test_keep_last_jobs_never_deletes_running() {
        let repository = Arc::new(InMemJobRepository::new());
        repository.create_or_update(job("running", "Foo", 0)).await.unwrap();
        repository
            .create_or_update(stopped("done-1", "Foo", 1))
            .await
            .unwrap();
        repository
            .create_or_update(stopped("done-2", "Foo", 2))
            .await
            .unwrap();

        KeepLastJobs::new(repository.clone(), 1)
            .do_cleanup()
            .await
            .unwrap();

        assert_eq!(ids_of(&repository, "Foo").await, vec!["done-2", "running"]);
    }

    #[tokio::test]
    async fn test_delete_skipped_jobs_keeps_other_statuses() {
        let repository = Arc::new(InMemJobRepository::new());
        for (id, minutes) in [("s-1", 1), ("s-2", 2), ("s-3", 3)] {
            repository
                .create_or_update(skipped(id, "Foo", minutes))
                .await
                .unwrap();
        }
        repository
            .create_or_update(stopped("ok-0", "Foo", 0))
            .await
            .unwrap();

        DeleteSkippedJobs::new(repository.clone(), 1)
            .do_cleanup()
            .await
            .unwrap();

        assert_eq!(ids_of(&repository, "Foo").await, vec!["s-3", "ok-0"]);
    }

    #[tokio::test]
    async fn test_stop_dead_jobs_marks_silent_job() {
        let repository = Arc::new(InMemJobRepository::new());
        let locks = Arc::new(InMemJobLockRepository::new());
        let clock = Arc::new(ManualClock::new(base_time()));

        repository.create_or_update(job("silent", "Foo", 0)).await.unwrap();
        let mut group = HashSet::new();
        group.insert("Foo".to_string());
        locks
            .mark_running_if_possible("Foo", "silent", &group)
            .await
            .unwrap();

        let strategy = StopDeadJobs::new(
            repository.clone(),
            locks.clone(),
            clock.clone(),
            Duration::from_secs(30),
        );

        // Exactly at the threshold is not yet dead
        clock.advance(ChronoDuration::seconds(30));
        strategy.do_cleanup().await.unwrap();
        let still_running = repository.find_one("silent").await.unwrap().unwrap();
        assert!(!still_running.is_stopped());

        clock.advance(ChronoDuration::seconds(1));
        strategy.do_cleanup().await.unwrap();

        let dead = repository.find_one("silent").await.unwrap().unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.stopped, Some(clock.now()));
        assert_eq!(dead.last_message(), Some(JOB_DEAD_MESSAGE));
        assert!(locks.running_jobs().await.unwrap().is_empty());

        // A second sweep leaves the dead record untouched
        clock.advance(ChronoDuration::minutes(5));
        strategy.do_cleanup().await.unwrap();
        let again = repository.find_one("silent").await.unwrap().unwrap();
        assert_eq!(again, dead);
    }

    #[tokio::test]
    async fn test_stop_dead_jobs_keeps_lock_of_other_job() {
        let repository = Arc::new(InMemJobRepository::new());
        let locks = Arc::new(InMemJobLockRepository::new());

        repository.create_or_update(job("silent", "Foo", 0)).await.unwrap();
        let mut group = HashSet::new();
        group.insert("Foo".to_string());
        locks
            .mark_running_if_possible("Foo", "successor", &group)
            .await
            .unwrap();

        let now = base_time() + ChronoDuration::hours(1);
        let killed = kill_jobs_dead_since(
            repository.as_ref(),
            locks.as_ref(),
            now - ChronoDuration::seconds(30),
            now,
        )
        .await
        .unwrap();

        assert_eq!(killed.len(), 1);
        let running = locks.running_jobs().await.unwrap();
        assert_eq!(running.get("Foo").map(String::as_str), Some("successor"));
    }

    /// Finishes every candidate right after the sweep's candidate query,
    /// as a runner completing concurrently would.
    struct FinishesDuringSweep {
        inner: InMemJobRepository,
    }

    #[async_trait]
    impl JobRepository for FinishesDuringSweep {
        async fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, JobsError> {
            self.inner.create_or_update(job).await
        }
        async fn update_if_running(&self, job: JobInfo) -> Result<bool, JobsError> {
            self.inner.update_if_running(job).await
        }
        async fn mark_dead_if_silent(
            &self,
            id: &str,
            cutoff: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Option<JobInfo>, JobsError> {
            self.inner.mark_dead_if_silent(id, cutoff, now).await
        }
        async fn find_one(&self, id: &str) -> Result<Option<JobInfo>, JobsError> {
            self.inner.find_one(id).await
        }
        async fn find_all(&self, skip: usize, limit: usize) -> Result<Vec<JobInfo>, JobsError> {
            self.inner.find_all(skip, limit).await
        }
        async fn find_latest_by(&self, t: &str, n: usize) -> Result<Vec<JobInfo>, JobsError> {
            self.inner.find_latest_by(t, n).await
        }
        async fn find_latest_finished_by(
            &self,
            t: &str,
            status: JobStatus,
            n: usize,
        ) -> Result<Vec<JobInfo>, JobsError> {
            self.inner.find_latest_finished_by(t, status, n).await
        }
        async fn find_latest_finished_except(
            &self,
            t: &str,
            excluded: JobStatus,
            n: usize,
        ) -> Result<Vec<JobInfo>, JobsError> {
            self.inner.find_latest_finished_except(t, excluded, n).await
        }
        async fn find_latest_distinct(&self) -> Result<Vec<JobInfo>, JobsError> {
            self.inner.find_latest_distinct().await
        }
        async fn find_by_type(&self, t: &str) -> Result<Vec<JobInfo>, JobsError> {
            self.inner.find_by_type(t).await
        }
        async fn find_running_without_update_since(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<JobInfo>, JobsError> {
            let candidates = self.inner.find_running_without_update_since(cutoff).await?;
            for candidate in &candidates {
                let mut finished = candidate.clone();
                let at = cutoff + ChronoDuration::seconds(10);
                finished.info("done", at);
                finished.stop(at);
                assert!(self.inner.update_if_running(finished).await?);
            }
            Ok(candidates)
        }
        async fn find_status(&self, id: &str) -> Result<Option<JobStatus>, JobsError> {
            self.inner.find_status(id).await
        }
        async fn append_message(
            &self,
            id: &str,
            message: crate::types::JobMessage,
        ) -> Result<(), JobsError> {
            self.inner.append_message(id, message).await
        }
        async fn remove_if_stopped(&self, id: &str) -> Result<(), JobsError> {
            self.inner.remove_if_stopped(id).await
        }
        async fn delete_all(&self) -> Result<(), JobsError> {
            self.inner.delete_all().await
        }
        async fn size(&self) -> Result<usize, JobsError> {
            self.inner.size().await
        }
    }

    #[tokio::test]
    async fn test_sweep_leaves_job_that_finished_meanwhile() {
        let repository = FinishesDuringSweep {
            inner: InMemJobRepository::new(),
        };
        let locks = InMemJobLockRepository::new();
        repository.create_or_update(job("slow", "Foo", 0)).await.unwrap();
        let mut group = HashSet::new();
        group.insert("Foo".to_string());
        locks
            .mark_running_if_possible("Foo", "slow", &group)
            .await
            .unwrap();

        let now = base_time() + ChronoDuration::hours(1);
        let killed = kill_jobs_dead_since(
            &repository,
            &locks,
            now - ChronoDuration::seconds(30),
            now,
        )
        .await
        .unwrap();

        assert!(killed.is_empty());
        let stored = repository.find_one("slow").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ok);
        assert!(stored.is_stopped());
        assert_eq!(stored.last_message(), Some("done"));
        // The finishing runner releases its own lock, the sweep does not
        assert_eq!(
            locks.running_jobs().await.unwrap().get("Foo").map(String::as_str),
            Some("slow")
        );
    }

    struct CountingStrategy {
        runs: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl JobCleanupStrategy for CountingStrategy {
        fn name(&self) -> &'static str {
            "Counting"
        }

        async fn do_cleanup(&self) -> Result<(), JobsError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(JobsError::Store("unreachable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_survives_failed_sweeps_and_stops() {
        let failing = Arc::new(CountingStrategy {
            runs: AtomicU32::new(0),
            fail: true,
        });
        let scheduler =
            CleanupScheduler::new().with_strategy(failing.clone(), Duration::from_secs(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Ticks at 0s, 10s and 20s
        assert_eq!(failing.runs.load(Ordering::SeqCst), 3);
    }

    // === Property Tests ===

    proptest! {
        #[test]
        fn prop_keep_last_jobs_leaves_min_n_terminal(
            finished in 0usize..12,
            running in 0usize..3,
            keep in 0usize..8,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let repository = Arc::new(InMemJobRepository::new());
                for i in 0..finished {
                    repository
                        .create_or_update(stopped(&format!("done-{:02}", i), "Foo", i as i64))
                        .await
                        .unwrap();
                }
                for i in 0..running {
                    repository
                        .create_or_update(job(&format!("run-{:02}", i), "Foo", i as i64))
                        .await
                        .unwrap();
                }

                KeepLastJobs::new(repository.clone(), keep).do_cleanup().await.unwrap();

                let left = repository.find_by_type("Foo").await.unwrap();
                let terminal = left.iter().filter(|j| j.is_stopped()).count();
                let live = left.iter().filter(|j| !j.is_stopped()).count();
                assert_eq!(terminal, keep.min(finished));
                assert_eq!(live, running);
            });
        }
    }
}
