//! Job record storage.
//!
//! [`JobRepository`] is the contract every backend satisfies. All list
//! queries return records newest-started first; records started at the same
//! instant are ordered by id, descending, in every shipped backend.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::JobsError;
use crate::types::{JobInfo, JobMessage, JobStatus};

pub mod memory;
pub mod sqlite;

pub use memory::InMemJobRepository;
pub use sqlite::SqliteJobRepository;

/// Durable storage for job records.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert or replace a record by id.
    ///
    /// Fails with [`JobsError::InvalidInput`] if the id is empty.
    async fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, JobsError>;

    /// Replace a record only while the stored copy is still running.
    ///
    /// Returns `false` and writes nothing if the stored record is stopped or
    /// absent. The check and the write are one atomic step, so a DEAD written
    /// by the dead-job sweep is never overwritten by its runner.
    async fn update_if_running(&self, job: JobInfo) -> Result<bool, JobsError>;

    /// Mark a running record dead if its `last_updated` is before `cutoff`.
    ///
    /// Applies [`JobInfo::dead`] at `now` to the stored record as one atomic
    /// step. Returns the updated record, or `None` if the record is stopped,
    /// was updated since `cutoff`, or does not exist.
    async fn mark_dead_if_silent(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobInfo>, JobsError>;

    async fn find_one(&self, id: &str) -> Result<Option<JobInfo>, JobsError>;

    /// Page through every record, newest first.
    async fn find_all(&self, skip: usize, limit: usize) -> Result<Vec<JobInfo>, JobsError>;

    async fn find_latest(&self, max_count: usize) -> Result<Vec<JobInfo>, JobsError> {
        self.find_all(0, max_count).await
    }

    async fn find_latest_by(
        &self,
        job_type: &str,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError>;

    /// Newest stopped records of a type with the given status.
    async fn find_latest_finished_by(
        &self,
        job_type: &str,
        status: JobStatus,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError>;

    /// Newest stopped records of a type, leaving out those with status `excluded`.
    async fn find_latest_finished_except(
        &self,
        job_type: &str,
        excluded: JobStatus,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError>;

    /// The newest record of every job type.
    async fn find_latest_distinct(&self) -> Result<Vec<JobInfo>, JobsError>;

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, JobsError>;

    /// Running records whose `last_updated` is strictly before `cutoff`.
    async fn find_running_without_update_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, JobsError>;

    async fn find_status(&self, id: &str) -> Result<Option<JobStatus>, JobsError>;

    /// Atomically append a message and advance `last_updated`.
    ///
    /// Does nothing if the record does not exist.
    async fn append_message(&self, id: &str, message: JobMessage) -> Result<(), JobsError>;

    /// Delete a record if it is stopped. Running or absent records are left alone.
    async fn remove_if_stopped(&self, id: &str) -> Result<(), JobsError>;

    async fn delete_all(&self) -> Result<(), JobsError>;

    async fn size(&self) -> Result<usize, JobsError>;
}

/// Ordering shared by every backend: newest `started` first, then id descending.
pub fn newest_first(a: &JobInfo, b: &JobInfo) -> Ordering {
    b.started.cmp(&a.started).then_with(|| b.id.cmp(&a.id))
}

pub(crate) fn ensure_id(job: &JobInfo) -> Result<(), JobsError> {
    if job.id.trim().is_empty() {
        return Err(JobsError::InvalidInput(format!(
            "job of type '{}' has no id",
            job.job_type
        )));
    }
    Ok(())
}
