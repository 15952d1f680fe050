//! Job records and their state machine.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Message recorded when the dead-job detector gives up on a job.
pub const JOB_DEAD_MESSAGE: &str = "Job didn't receive updates for a while, considering it dead";

/// Message recorded when a job decides there is nothing to do.
pub const JOB_SKIPPED_MESSAGE: &str = "Skipped job ..";

/// Status of a job execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Ok,
    Error,
    /// Marked dead by the dead-job detector.
    Dead,
    /// Finished without doing any work.
    Skipped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Ok => "OK",
            JobStatus::Error => "ERROR",
            JobStatus::Dead => "DEAD",
            JobStatus::Skipped => "SKIPPED",
        }
    }

    /// Whether a finished job with this status counts as failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Error | JobStatus::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(JobStatus::Ok),
            "ERROR" => Ok(JobStatus::Error),
            "DEAD" => Ok(JobStatus::Dead),
            "SKIPPED" => Ok(JobStatus::Skipped),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Severity of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Level::Info),
            "WARNING" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            other => Err(format!("unknown message level '{}'", other)),
        }
    }
}

/// A human-readable line in a job's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub level: Level,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(level: Level, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            level,
            text: text.into(),
            timestamp,
        }
    }
}

/// Persisted state of one job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Unique job id, immutable.
    pub id: String,
    /// Job type, drives locking, retention and status policy.
    pub job_type: String,
    /// Instance that ran the job.
    pub hostname: String,
    /// When the job was created.
    pub started: DateTime<Utc>,
    /// Advanced by every message, ping and status change. Never decreases.
    pub last_updated: DateTime<Utc>,
    /// Set once when the job reaches a terminal state.
    pub stopped: Option<DateTime<Utc>>,
    pub status: JobStatus,
    /// Append-only, in insertion order.
    pub messages: Vec<JobMessage>,
}

impl JobInfo {
    /// Create a freshly started, running job.
    pub fn new(
        id: impl Into<String>,
        job_type: impl Into<String>,
        hostname: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            hostname: hostname.into(),
            started: now,
            last_updated: now,
            stopped: None,
            status: JobStatus::Ok,
            messages: Vec::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    /// Advance `last_updated`, ignoring clock readings from the past.
    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    /// Append a message as a store would, advancing `last_updated`.
    pub fn push_message(&mut self, message: JobMessage) {
        self.touch(message.timestamp);
        self.messages.push(message);
    }

    fn record(&mut self, level: Level, text: impl Into<String>, now: DateTime<Utc>) {
        self.push_message(JobMessage::new(level, text, now));
    }

    pub fn ping(&mut self, now: DateTime<Utc>) {
        self.touch(now);
    }

    pub fn info(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        self.record(Level::Info, text, now);
    }

    pub fn warn(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        self.record(Level::Warning, text, now);
    }

    /// Record an error. The job keeps running until stopped or restarted.
    ///
    /// Status transitions (`error`, `restart`, `stop`, `dead`, `skipped`) do
    /// nothing once the job is stopped: a terminal status is frozen.
    pub fn error(&mut self, text: impl Into<String>, now: DateTime<Utc>) {
        if self.is_stopped() {
            return;
        }
        self.record(Level::Error, text, now);
        self.status = JobStatus::Error;
    }

    /// Record the `attempt`-th restart and reset the status to OK.
    pub fn restart(&mut self, attempt: u32, now: DateTime<Utc>) {
        if self.is_stopped() {
            return;
        }
        self.record(
            Level::Warning,
            format!("{}. restart of Job after error.", attempt),
            now,
        );
        self.status = JobStatus::Ok;
    }

    pub fn stop(&mut self, now: DateTime<Utc>) {
        if self.is_stopped() {
            return;
        }
        self.touch(now);
        self.stopped = Some(self.last_updated);
    }

    pub fn dead(&mut self, now: DateTime<Utc>) {
        if self.is_stopped() {
            return;
        }
        self.record(Level::Warning, JOB_DEAD_MESSAGE, now);
        self.status = JobStatus::Dead;
        self.stopped = Some(self.last_updated);
    }

    pub fn skipped(&mut self, now: DateTime<Utc>) {
        if self.is_stopped() {
            return;
        }
        self.record(Level::Info, JOB_SKIPPED_MESSAGE, now);
        self.status = JobStatus::Skipped;
        self.stopped = Some(self.last_updated);
    }

    /// Text of the most recent message, if any.
    pub fn last_message(&self) -> Option<&str> {
        self.messages.last().map(|m| m.text.as_str())
    }
}

/// A running job shared between its execution task and its ping task.
///
/// Every mutation goes through one lock, so the two tasks never interleave
/// halfway through a transition.
#[derive(Clone)]
pub struct SharedJob {
    id: Arc<str>,
    job_type: Arc<str>,
    inner: Arc<Mutex<JobInfo>>,
    clock: Arc<dyn Clock>,
}

impl SharedJob {
    pub fn new(job: JobInfo, clock: Arc<dyn Clock>) -> Self {
        Self {
            id: Arc::from(job.id.as_str()),
            job_type: Arc::from(job.job_type.as_str()),
            inner: Arc::new(Mutex::new(job)),
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Copy of the current state, suitable for persisting.
    pub fn snapshot(&self) -> JobInfo {
        self.inner.lock().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.inner.lock().status
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().is_stopped()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.inner.lock().last_updated
    }

    pub fn ping(&self) {
        let now = self.clock.now();
        self.inner.lock().ping(now);
    }

    pub fn info(&self, text: impl Into<String>) {
        let now = self.clock.now();
        self.inner.lock().info(text, now);
    }

    pub fn warn(&self, text: impl Into<String>) {
        let now = self.clock.now();
        self.inner.lock().warn(text, now);
    }

    pub fn error(&self, text: impl Into<String>) {
        let now = self.clock.now();
        self.inner.lock().error(text, now);
    }

    pub fn restart(&self, attempt: u32) {
        let now = self.clock.now();
        self.inner.lock().restart(attempt, now);
    }

    pub fn stop(&self) {
        let now = self.clock.now();
        self.inner.lock().stop(now);
    }

    pub fn dead(&self) {
        let now = self.clock.now();
        self.inner.lock().dead(now);
    }

    pub fn skipped(&self) {
        let now = self.clock.now();
        self.inner.lock().skipped(now);
    }
}

impl fmt::Debug for SharedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedJob")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .finish()
    }
}
