//! Execution of a single job.
//!
//! A [`JobRunner`] owns one job from the moment it is persisted until it is
//! stopped: it keeps the stored record alive with periodic pings, restarts
//! failed attempts within the definition's budget, and releases the job
//! type's lock when done.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::definition::JobDefinition;
use crate::error::{JobFailure, JobsError};
use crate::events::{JobEventPublisher, JobEventSink, JobState};
use crate::lock::JobLockRepository;
use crate::store::JobRepository;
use crate::types::{JobInfo, JobStatus, SharedJob};

/// Period of the liveness ping, independent of any job's own schedule.
pub const PING_PERIOD: Duration = Duration::from_secs(20);

/// The executable part of a job.
#[async_trait]
pub trait JobRunnable: Send + Sync {
    fn definition(&self) -> &JobDefinition;

    /// Do the work of one attempt.
    ///
    /// Returning `Err`, panicking, or recording an error through the context
    /// all count as a failed attempt.
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobFailure>;
}

/// What a running job gets to see of itself.
#[derive(Clone)]
pub struct JobContext {
    job: SharedJob,
    events: JobEventPublisher,
}

impl JobContext {
    pub fn job(&self) -> &SharedJob {
        &self.job
    }

    pub fn events(&self) -> &JobEventPublisher {
        &self.events
    }

    pub fn job_id(&self) -> &str {
        self.job.id()
    }

    pub fn info(&self, text: impl Into<String>) {
        self.events.info(text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.events.warn(text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.events.error(text);
    }

    /// End the job as skipped. The runner will not restart or stop it again.
    pub fn skip(&self) {
        self.job.skipped();
    }
}

/// Drives one job execution from creation to its terminal state.
pub struct JobRunner {
    job: SharedJob,
    repository: Arc<dyn JobRepository>,
    locks: Arc<dyn JobLockRepository>,
    events: JobEventPublisher,
    ping_period: Duration,
}

impl JobRunner {
    /// Persist the freshly created job and return a runner for it.
    ///
    /// The job's type must already be marked running in `locks`; the runner
    /// clears that mark when the job ends.
    pub async fn create(
        job: SharedJob,
        repository: Arc<dyn JobRepository>,
        locks: Arc<dyn JobLockRepository>,
        sink: Arc<dyn JobEventSink>,
    ) -> Result<Self, JobsError> {
        repository.create_or_update(job.snapshot()).await?;
        let events = JobEventPublisher::new(job.clone(), sink);
        Ok(Self {
            job,
            repository,
            locks,
            events,
            ping_period: PING_PERIOD,
        })
    }

    /// Override the liveness ping period.
    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    pub fn job(&self) -> &SharedJob {
        &self.job
    }

    /// Run the job to completion and return its final state.
    pub async fn run(self, runnable: Arc<dyn JobRunnable>) -> JobInfo {
        self.run_when_ready(runnable, async { Some(()) }).await
    }

    /// Run the job once `ready` yields, keeping it alive with pings meanwhile.
    ///
    /// The value `ready` yields, such as a worker permit, is held until the job
    /// ends. If it yields `None` the job is stopped with an error and never
    /// executed; so is a job the dead-job sweep killed while it waited.
    #[tracing::instrument(skip(self, runnable, ready), fields(job_id = %self.job.id(), job_type = %self.job.job_type()))]
    pub async fn run_when_ready<G, F>(self, runnable: Arc<dyn JobRunnable>, ready: F) -> JobInfo
    where
        F: Future<Output = Option<G>> + Send,
        G: Send,
    {
        let ping = PingTask::spawn(
            self.job.clone(),
            self.repository.clone(),
            self.ping_period,
        );
        self.events.state_changed(JobState::Create);

        let guard = ready.await;
        if guard.is_none() {
            self.job.error("job could not get a worker");
        }
        self.adopt_dead_status().await;

        let mut attempt = 0u32;
        if guard.is_some() && !self.job.is_stopped() {
            info!("job started");
            let ctx = JobContext {
                job: self.job.clone(),
                events: self.events.clone(),
            };
            let restarts = runnable.definition().restarts;

            loop {
                let succeeded = self.execute_once(runnable.as_ref(), &ctx).await;
                if succeeded || self.job.is_stopped() || attempt >= restarts {
                    break;
                }
                // The sweep may have killed the job during the failed attempt
                self.adopt_dead_status().await;
                if self.job.is_stopped() {
                    break;
                }
                attempt += 1;
                warn!(attempt, restarts, "restarting job after error");
                self.job.restart(attempt);
                self.persist().await;
                if self.job.is_stopped() {
                    break;
                }
                self.events.state_changed(JobState::Restart);
            }
        }

        ping.cancel();
        self.adopt_dead_status().await;
        self.job.stop();
        self.persist().await;

        // Only releases the lock if it still belongs to this job
        match self
            .locks
            .clear_running_if(self.job.job_type(), self.job.id())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!("lock already released"),
            Err(e) => error!(error = %e, "failed to clear running mark"),
        }

        let final_state = self.job.snapshot();
        drop(guard);
        match final_state.status {
            JobStatus::Dead => {
                warn!("job finished after being marked dead");
                self.events.state_changed(JobState::Dead);
            }
            JobStatus::Error => {
                error!(attempts = attempt + 1, "job failed");
                self.events.state_changed(JobState::Stop);
            }
            status => {
                info!(%status, "job finished");
                self.events.state_changed(JobState::Stop);
            }
        }
        final_state
    }

    /// Run one attempt. Returns true if it succeeded.
    ///
    /// A failure after the job already reached a terminal state, e.g. after
    /// `skip()`, leaves that state alone.
    async fn execute_once(&self, runnable: &dyn JobRunnable, ctx: &JobContext) -> bool {
        let outcome = AssertUnwindSafe(runnable.execute(ctx)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => self.job.status() != JobStatus::Error,
            Ok(Err(failure)) => {
                if self.job.is_stopped() {
                    warn!(error = %failure, "ignoring failure of a finished job");
                } else {
                    self.job.error(failure.message);
                }
                false
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "job panicked");
                self.job.error(message);
                false
            }
        }
    }

    /// Mark the job dead if the dead-job sweep got to it since the last write.
    async fn adopt_dead_status(&self) {
        if self.job.is_stopped() {
            return;
        }
        match self.repository.find_status(self.job.id()).await {
            Ok(Some(JobStatus::Dead)) => {
                warn!("job was marked dead");
                self.job.dead();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read job status"),
        }
    }

    /// Write the current state unless the stored record already stopped.
    async fn persist(&self) {
        match self.repository.update_if_running(self.job.snapshot()).await {
            Ok(true) => {}
            Ok(false) => self.adopt_dead_status().await,
            Err(e) => error!(error = %e, "failed to persist job"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

/// Periodic liveness ping for one job. Aborted when dropped.
struct PingTask {
    handle: JoinHandle<()>,
}

impl PingTask {
    fn spawn(job: SharedJob, repository: Arc<dyn JobRepository>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if let Err(e) = ping_once(&job, repository.as_ref()).await {
                    warn!(job_id = %job.id(), error = %e, "failed to ping job");
                }
            }
        });
        Self { handle }
    }

    fn cancel(self) {
        // Drop aborts
    }
}

impl Drop for PingTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One liveness ping: refresh `last_updated` in the store while the stored
/// record is running, otherwise adopt a DEAD status written by the sweep.
pub(crate) async fn ping_once(
    job: &SharedJob,
    repository: &dyn JobRepository,
) -> Result<(), JobsError> {
    if job.is_stopped() {
        return Ok(());
    }
    job.ping();
    if repository.update_if_running(job.snapshot()).await? {
        debug!(job_id = %job.id(), "ping");
        return Ok(());
    }
    if repository.find_status(job.id()).await? == Some(JobStatus::Dead) {
        warn!(job_id = %job.id(), "job was marked dead");
        job.dead();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::events::{BroadcastEventSink, JobEventKind, NoopEventSink};
    use crate::lock::InMemJobLockRepository;
    use crate::store::InMemJobRepository;
    use crate::types::{JOB_DEAD_MESSAGE, JOB_SKIPPED_MESSAGE, Level};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    type Body = Box<dyn Fn(&JobContext) -> Result<(), JobFailure> + Send + Sync>;

    struct TestJob {
        definition: JobDefinition,
        executions: AtomicU32,
        body: Body,
    }

    impl TestJob {
        fn new(restarts: u32, body: Body) -> Arc<Self> {
            Arc::new(Self {
                definition: JobDefinition::manually_triggered("Foo", "Foo", "", restarts, None),
                executions: AtomicU32::new(0),
                body,
            })
        }

        fn executions(&self) -> u32 {
            self.executions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobRunnable for TestJob {
        fn definition(&self) -> &JobDefinition {
            &self.definition
        }

        async fn execute(&self, ctx: &JobContext) -> Result<(), JobFailure> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            (self.body)(ctx)
        }
    }

    struct Fixture {
        repository: Arc<InMemJobRepository>,
        locks: Arc<InMemJobLockRepository>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                repository: Arc::new(InMemJobRepository::new()),
                locks: Arc::new(InMemJobLockRepository::new()),
            }
        }

        async fn runner(&self, clock: Arc<dyn Clock>) -> JobRunner {
            let job = SharedJob::new(
                JobInfo::new("job-42", "Foo", "localhost", clock.now()),
                clock,
            );
            let mut group = HashSet::new();
            group.insert("Foo".to_string());
            self.locks
                .mark_running_if_possible("Foo", "job-42", &group)
                .await
                .unwrap();
            JobRunner::create(
                job,
                self.repository.clone(),
                self.locks.clone(),
                Arc::new(NoopEventSink),
            )
            .await
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_create_persists_running_job() {
        let fixture = Fixture::new();
        let _runner = fixture.runner(Arc::new(SystemClock)).await;

        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ok);
        assert!(!stored.is_stopped());
    }

    #[tokio::test]
    async fn test_successful_job_is_stopped_and_unlocked() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(
            1,
            Box::new(|ctx| {
                ctx.info("a message");
                Ok(())
            }),
        );

        runner.run(job.clone()).await;

        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Ok);
        assert!(stored.is_stopped());
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].text, "a message");
        assert_eq!(stored.messages[0].level, Level::Info);
        assert_eq!(job.executions(), 1);
        assert!(fixture.locks.running_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_on_error_message() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(
            1,
            Box::new(|ctx| {
                ctx.error("boom");
                Ok(())
            }),
        );

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 2);
        let messages: Vec<(Level, &str)> = final_state
            .messages
            .iter()
            .map(|m| (m.level, m.text.as_str()))
            .collect();
        assert_eq!(
            messages,
            vec![
                (Level::Error, "boom"),
                (Level::Warning, "1. restart of Job after error."),
                (Level::Error, "boom"),
            ]
        );
        assert_eq!(final_state.status, JobStatus::Error);
        assert!(final_state.is_stopped());

        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored, final_state);
    }

    #[tokio::test]
    async fn test_restart_on_returned_failure() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(1, Box::new(|_| Err(JobFailure::new("some error"))));

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 2);
        assert_eq!(final_state.messages.len(), 3);
        assert_eq!(final_state.messages[0].text, "some error");
        assert_eq!(final_state.messages[2].text, "some error");
        assert_eq!(final_state.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_restart_on_panic() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(1, Box::new(|_| panic!("some panic")));

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 2);
        assert_eq!(final_state.messages[0].level, Level::Error);
        assert_eq!(final_state.messages[0].text, "some panic");
        assert_eq!(final_state.status, JobStatus::Error);
        assert!(fixture.locks.running_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempts_are_budget_plus_one() {
        for restarts in 0..4u32 {
            let fixture = Fixture::new();
            let runner = fixture.runner(Arc::new(SystemClock)).await;
            let job = TestJob::new(restarts, Box::new(|_| Err("always".into())));

            let final_state = runner.run(job.clone()).await;

            assert_eq!(job.executions(), restarts + 1);
            let restart_warnings = final_state
                .messages
                .iter()
                .filter(|m| m.level == Level::Warning)
                .count();
            assert_eq!(restart_warnings, restarts as usize);
            assert_eq!(final_state.status, JobStatus::Error);
        }
    }

    #[tokio::test]
    async fn test_success_after_restart_ends_ok() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let job = TestJob::new(
            3,
            Box::new(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("first attempt fails".into())
                } else {
                    Ok(())
                }
            }),
        );

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 2);
        assert_eq!(final_state.status, JobStatus::Ok);
    }

    #[tokio::test]
    async fn test_skipped_job_is_not_restarted() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(
            2,
            Box::new(|ctx| {
                ctx.skip();
                Ok(())
            }),
        );

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 1);
        assert_eq!(final_state.status, JobStatus::Skipped);
        assert!(fixture.locks.running_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publishes_create_and_stop() {
        let fixture = Fixture::new();
        let sink = BroadcastEventSink::new();
        let mut rx = sink.subscribe();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let job = SharedJob::new(JobInfo::new("job-1", "Foo", "localhost", clock.now()), clock);
        let runner = JobRunner::create(
            job,
            fixture.repository.clone(),
            fixture.locks.clone(),
            Arc::new(sink),
        )
        .await
        .unwrap();

        runner.run(TestJob::new(0, Box::new(|_| Ok(())))).await;

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let JobEventKind::StateChanged { state } = event.kind {
                states.push(state);
            }
        }
        assert_eq!(states, vec![JobState::Create, JobState::Stop]);
    }

    #[tokio::test]
    async fn test_ping_refreshes_last_updated() {
        let fixture = Fixture::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let runner = fixture.runner(clock.clone()).await;

        clock.advance(chrono::Duration::minutes(1));
        ping_once(runner.job(), fixture.repository.as_ref())
            .await
            .unwrap();

        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored.last_updated, clock.now());
        assert_eq!(stored.status, JobStatus::Ok);
    }

    #[tokio::test]
    async fn test_ping_adopts_dead_status() {
        let fixture = Fixture::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let runner = fixture.runner(clock.clone()).await;

        let mut dead = runner.job().snapshot();
        dead.dead(clock.now());
        fixture.repository.create_or_update(dead.clone()).await.unwrap();

        clock.advance(chrono::Duration::minutes(1));
        ping_once(runner.job(), fixture.repository.as_ref())
            .await
            .unwrap();

        assert_eq!(runner.job().status(), JobStatus::Dead);
        assert!(runner.job().is_stopped());
        // The ping never writes over the sweep's record
        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored, dead);

        ping_once(runner.job(), fixture.repository.as_ref())
            .await
            .unwrap();
        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored, dead);
    }

    /// Signals `entered`, then waits for `release` and fails if `fail` is set.
    struct BlockingJob {
        definition: JobDefinition,
        entered: Arc<Notify>,
        release: Arc<Notify>,
        fail: bool,
        executions: AtomicU32,
    }

    impl BlockingJob {
        fn new(restarts: u32, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                definition: JobDefinition::manually_triggered("Foo", "Foo", "", restarts, None),
                entered: Arc::new(Notify::new()),
                release: Arc::new(Notify::new()),
                fail,
                executions: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobRunnable for BlockingJob {
        fn definition(&self) -> &JobDefinition {
            &self.definition
        }

        async fn execute(&self, _ctx: &JobContext) -> Result<(), JobFailure> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            if self.fail {
                return Err(JobFailure::new("late failure"));
            }
            Ok(())
        }
    }

    async fn claim_for_successor(locks: &InMemJobLockRepository) {
        let mut group = HashSet::new();
        group.insert("Foo".to_string());
        locks
            .mark_running_if_possible("Foo", "job-43", &group)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_job_keeps_lock_of_successor() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = BlockingJob::new(0, false);
        let handle = tokio::spawn(runner.run(job.clone()));
        job.entered.notified().await;

        // Simulate the dead-job sweep: mark dead, release the lock, let a successor claim it
        let mut dead = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        dead.dead(Utc::now());
        fixture.repository.create_or_update(dead).await.unwrap();
        fixture.locks.clear_running("Foo").await.unwrap();
        claim_for_successor(&fixture.locks).await;

        tokio::time::sleep(PING_PERIOD * 2).await;
        job.release.notify_one();
        let final_state = handle.await.unwrap();

        assert_eq!(final_state.status, JobStatus::Dead);
        assert_eq!(final_state.last_message(), Some(JOB_DEAD_MESSAGE));
        let running = fixture.locks.running_jobs().await.unwrap();
        assert_eq!(running.get("Foo").map(String::as_str), Some("job-43"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_sweep_does_not_restart_or_unlock_successor() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = BlockingJob::new(1, true);
        let handle = tokio::spawn(runner.run(job.clone()));
        job.entered.notified().await;

        // The sweep kills the job before any ping, then a successor claims the type
        let now = Utc::now();
        let killed = crate::cleanup::kill_jobs_dead_since(
            fixture.repository.as_ref(),
            fixture.locks.as_ref(),
            now + chrono::Duration::seconds(1),
            now,
        )
        .await
        .unwrap();
        assert_eq!(killed.len(), 1);
        claim_for_successor(&fixture.locks).await;

        job.release.notify_one();
        let final_state = handle.await.unwrap();

        assert_eq!(job.executions.load(Ordering::SeqCst), 1);
        assert_eq!(final_state.status, JobStatus::Dead);
        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dead);
        assert!(stored.is_stopped());
        assert!(
            stored
                .messages
                .iter()
                .all(|m| !m.text.contains("restart of Job"))
        );
        let running = fixture.locks.running_jobs().await.unwrap();
        assert_eq!(running.get("Foo").map(String::as_str), Some("job-43"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_dead_adopted_stays_dead() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = BlockingJob::new(2, true);
        let handle = tokio::spawn(runner.run(job.clone()));
        job.entered.notified().await;

        let mut dead = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        dead.dead(Utc::now());
        fixture.repository.create_or_update(dead.clone()).await.unwrap();
        fixture.locks.clear_running("Foo").await.unwrap();
        claim_for_successor(&fixture.locks).await;

        // Let the ping task adopt the DEAD status before the callback fails
        tokio::time::sleep(PING_PERIOD * 2).await;
        job.release.notify_one();
        let final_state = handle.await.unwrap();

        assert_eq!(job.executions.load(Ordering::SeqCst), 1);
        assert_eq!(final_state.status, JobStatus::Dead);
        assert!(final_state.messages.iter().all(|m| m.level != Level::Error));
        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored, dead);
        let running = fixture.locks.running_jobs().await.unwrap();
        assert_eq!(running.get("Foo").map(String::as_str), Some("job-43"));
    }

    #[tokio::test]
    async fn test_failure_after_skip_stays_skipped() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(
            2,
            Box::new(|ctx| {
                ctx.skip();
                Err("late failure".into())
            }),
        );

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 1);
        assert_eq!(final_state.status, JobStatus::Skipped);
        let messages: Vec<(Level, &str)> = final_state
            .messages
            .iter()
            .map(|m| (m.level, m.text.as_str()))
            .collect();
        assert_eq!(messages, vec![(Level::Info, JOB_SKIPPED_MESSAGE)]);
        assert!(fixture.locks.running_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_after_skip_stays_skipped() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(
            1,
            Box::new(|ctx| {
                ctx.skip();
                panic!("late panic")
            }),
        );

        let final_state = runner.run(job.clone()).await;

        assert_eq!(job.executions(), 1);
        assert_eq!(final_state.status, JobStatus::Skipped);
        let stored = fixture.repository.find_one("job-42").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Skipped);
    }

    #[tokio::test]
    async fn test_job_without_worker_is_not_executed() {
        let fixture = Fixture::new();
        let runner = fixture.runner(Arc::new(SystemClock)).await;
        let job = TestJob::new(0, Box::new(|_| Ok(())));

        let final_state = runner
            .run_when_ready(job.clone(), async { None::<()> })
            .await;

        assert_eq!(job.executions(), 0);
        assert_eq!(final_state.status, JobStatus::Error);
        assert!(final_state.is_stopped());
        assert!(fixture.locks.running_jobs().await.unwrap().is_empty());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "job panicked");
    }
}
