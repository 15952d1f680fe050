//! In-process lock registry.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{JobLockRepository, blocked_error, disabled_error};
use crate::error::JobsError;

#[derive(Debug, Default)]
struct LockState {
    running: BTreeMap<String, String>,
    disabled: BTreeMap<String, Option<String>>,
}

/// Lock registry guarded by a single mutex. Only excludes jobs within one process.
#[derive(Debug, Default)]
pub struct InMemJobLockRepository {
    state: Mutex<LockState>,
}

impl InMemJobLockRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLockRepository for InMemJobLockRepository {
    async fn mark_running_if_possible(
        &self,
        job_type: &str,
        job_id: &str,
        mutex_group: &HashSet<String>,
    ) -> Result<(), JobsError> {
        let mut state = self.state.lock();

        if state.disabled.contains_key(job_type) {
            return Err(disabled_error(job_type));
        }

        let mut blockers: Vec<String> = mutex_group
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(job_type))
            .filter(|t| state.running.contains_key(*t))
            .map(String::from)
            .collect();
        if !blockers.is_empty() {
            blockers.sort();
            blockers.dedup();
            return Err(blocked_error(job_type, &blockers));
        }

        state
            .running
            .insert(job_type.to_string(), job_id.to_string());
        debug!(job_type, job_id, "marked job type as running");
        Ok(())
    }

    async fn clear_running(&self, job_type: &str) -> Result<(), JobsError> {
        self.state.lock().running.remove(job_type);
        Ok(())
    }

    async fn clear_running_if(&self, job_type: &str, job_id: &str) -> Result<bool, JobsError> {
        let mut state = self.state.lock();
        if state.running.get(job_type).map(String::as_str) != Some(job_id) {
            return Ok(false);
        }
        state.running.remove(job_type);
        Ok(true)
    }

    async fn running_jobs(&self) -> Result<BTreeMap<String, String>, JobsError> {
        Ok(self.state.lock().running.clone())
    }

    async fn disable(&self, job_type: &str, comment: Option<&str>) -> Result<(), JobsError> {
        self.state
            .lock()
            .disabled
            .insert(job_type.to_string(), comment.map(String::from));
        Ok(())
    }

    async fn enable(&self, job_type: &str) -> Result<(), JobsError> {
        self.state.lock().disabled.remove(job_type);
        Ok(())
    }

    async fn find_disabled(&self) -> Result<BTreeSet<String>, JobsError> {
        Ok(self.state.lock().disabled.keys().cloned().collect())
    }

    async fn disable_comment(&self, job_type: &str) -> Result<Option<String>, JobsError> {
        Ok(self.state.lock().disabled.get(job_type).cloned().flatten())
    }

    async fn delete_all(&self) -> Result<(), JobsError> {
        let mut state = self.state.lock();
        state.running.clear();
        state.disabled.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, JobsError> {
        Ok(self.state.lock().running.len())
    }
}
