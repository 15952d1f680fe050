//! Mutual exclusion between job types.
//!
//! The lock registry maps each running job type to the id of its job and
//! keeps the set of disabled job types. Claiming a job type is the only
//! operation that must be atomic across every process sharing the store.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;

use crate::error::JobsError;

pub mod memory;
pub mod sqlite;

pub use memory::InMemJobLockRepository;
pub use sqlite::SqliteJobLockRepository;

/// Ledger of running and disabled job types.
#[async_trait]
pub trait JobLockRepository: Send + Sync {
    /// Mark `job_type` as running `job_id`.
    ///
    /// Fails with [`JobsError::JobBlocked`] if the type is disabled or any
    /// type in `mutex_group` (which should contain `job_type`) is running.
    /// The check and the write happen as one atomic operation.
    async fn mark_running_if_possible(
        &self,
        job_type: &str,
        job_id: &str,
        mutex_group: &HashSet<String>,
    ) -> Result<(), JobsError>;

    /// Remove the running mark of `job_type`. Does nothing if there is none.
    async fn clear_running(&self, job_type: &str) -> Result<(), JobsError>;

    /// Remove the running mark of `job_type` only if it belongs to `job_id`.
    ///
    /// Returns whether a mark was removed. A mark claimed by another job is
    /// left in place.
    async fn clear_running_if(&self, job_type: &str, job_id: &str) -> Result<bool, JobsError>;

    /// Snapshot of job type to running job id.
    async fn running_jobs(&self) -> Result<BTreeMap<String, String>, JobsError>;

    /// Prevent `job_type` from being started, with an optional reason.
    async fn disable(&self, job_type: &str, comment: Option<&str>) -> Result<(), JobsError>;

    async fn enable(&self, job_type: &str) -> Result<(), JobsError>;

    async fn find_disabled(&self) -> Result<BTreeSet<String>, JobsError>;

    /// The reason given when `job_type` was disabled, if it is disabled and one was given.
    async fn disable_comment(&self, job_type: &str) -> Result<Option<String>, JobsError>;

    /// Drop every running mark and disabled entry.
    async fn delete_all(&self) -> Result<(), JobsError>;

    /// Number of running marks.
    async fn size(&self) -> Result<usize, JobsError>;
}

pub(crate) fn disabled_error(job_type: &str) -> JobsError {
    JobsError::JobBlocked(format!("job type '{}' is disabled", job_type))
}

pub(crate) fn blocked_error(job_type: &str, blockers: &[String]) -> JobsError {
    // The blocker may have finished between the refused claim and this lookup
    if blockers.is_empty() {
        return JobsError::JobBlocked(format!(
            "job type '{}' is blocked by a job that has since finished, try again",
            job_type
        ));
    }
    JobsError::JobBlocked(format!(
        "job type '{}' is blocked by running job type(s): {}",
        job_type,
        blockers.join(", ")
    ))
}
