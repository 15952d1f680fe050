//! Demo jobs run by the daemon.
//!
//! `Foo` is a long-running hourly job. `Bar` and `Fizzle` share the
//! `barFizzle` mutex group, so they never run at the same time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use vigil_jobs::{JobContext, JobDefinition, JobFailure, JobMutexGroup, JobRunnable};

pub const FOO: &str = "Foo";
pub const BAR: &str = "Bar";
pub const FIZZLE: &str = "Fizzle";

pub fn mutex_groups() -> Vec<JobMutexGroup> {
    vec![JobMutexGroup::new("barFizzle", [BAR, FIZZLE])]
}

/// Every demo job, ready to register with the service.
pub fn all(step: Duration) -> Vec<Arc<dyn JobRunnable>> {
    vec![
        Arc::new(FooJob::new(step)),
        Arc::new(BarJob::new(step)),
        Arc::new(FizzleJob::new(step)),
    ]
}

/// Works through 60 steps, reporting progress after each one.
pub struct FooJob {
    definition: JobDefinition,
    step: Duration,
}

impl FooJob {
    pub fn new(step: Duration) -> Self {
        Self {
            definition: JobDefinition::fixed_delay(
                FOO,
                "Foo Job",
                "An example job that is running for a while.",
                Duration::from_secs(60 * 60),
                0,
                Some(Duration::from_secs(3 * 60 * 60)),
            ),
            step,
        }
    }
}

#[async_trait]
impl JobRunnable for FooJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobFailure> {
        for i in 0..60u32 {
            ctx.info("Still doing some hard work...");
            // Uneven step lengths
            sleep(self.step * (i % 4 + 1) / 2).await;
        }
        Ok(())
    }
}

/// Fails every third run to show restarts.
pub struct BarJob {
    definition: JobDefinition,
    step: Duration,
    runs: AtomicU64,
}

impl BarJob {
    pub fn new(step: Duration) -> Self {
        Self {
            definition: JobDefinition::fixed_delay(
                BAR,
                "Bar Job",
                "Shares a mutex group with Fizzle and restarts once on error.",
                Duration::from_secs(5 * 60),
                1,
                None,
            ),
            step,
            runs: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl JobRunnable for BarJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobFailure> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        ctx.info(format!("Bar run {}", run));
        sleep(self.step * 5).await;
        if run % 3 == 2 {
            return Err(JobFailure::new("upstream returned garbage"));
        }
        ctx.info("Bar finished");
        Ok(())
    }
}

/// Skips every other run because there is nothing to do.
pub struct FizzleJob {
    definition: JobDefinition,
    step: Duration,
    runs: AtomicU64,
}

impl FizzleJob {
    pub fn new(step: Duration) -> Self {
        Self {
            definition: JobDefinition::fixed_delay(
                FIZZLE,
                "Fizzle Job",
                "Shares a mutex group with Bar and skips when idle.",
                Duration::from_secs(7 * 60),
                0,
                Some(Duration::from_secs(60 * 60)),
            ),
            step,
            runs: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl JobRunnable for FizzleJob {
    fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    async fn execute(&self, ctx: &JobContext) -> Result<(), JobFailure> {
        if self.runs.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
            ctx.skip();
            return Ok(());
        }
        ctx.info("Fizzling");
        sleep(self.step * 3).await;
        Ok(())
    }
}
