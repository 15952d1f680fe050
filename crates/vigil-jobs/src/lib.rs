//! Background job engine for long-running services.
//!
//! This crate provides:
//! - Jobs that run in the background, tracked as persistent records
//! - Mutual exclusion between job types, including named mutex groups
//! - Liveness pings and detection of jobs that silently died
//! - In-place restarts of failed runs within a per-type budget
//! - History cleanup and per-type health status
//!
//! Records and locks live behind the [`JobRepository`] and
//! [`JobLockRepository`] traits, with in-memory and SQLite backends.

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod definition;
mod error;
pub mod events;
pub mod lock;
pub mod runner;
pub mod service;
pub mod status;
pub mod store;
mod types;

pub use cleanup::{
    CleanupScheduler, DeleteSkippedJobs, JobCleanupStrategy, KeepLastJobs, StopDeadJobs,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CleanupConfig, JobsConfig, StatusConfig};
pub use definition::{JobDefinition, JobMutexGroup, JobMutexGroups};
pub use error::{JobFailure, JobsError};
pub use events::{
    BroadcastEventSink, JobEvent, JobEventKind, JobEventPublisher, JobEventSink, JobState,
    NoopEventSink,
};
pub use lock::{InMemJobLockRepository, JobLockRepository, SqliteJobLockRepository};
pub use runner::{JobContext, JobRunnable, JobRunner, PING_PERIOD};
pub use service::JobService;
pub use status::{
    CalculatorRegistry, JobStatusCalculator, JobStatusIndicator, Status, StatusContext,
    StatusDetail, aggregate_status,
};
pub use store::{InMemJobRepository, JobRepository, SqliteJobRepository};
pub use types::{
    JOB_DEAD_MESSAGE, JOB_SKIPPED_MESSAGE, JobInfo, JobMessage, JobStatus, Level, SharedJob,
};
