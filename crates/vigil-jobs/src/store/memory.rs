//! In-memory job repository.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{JobRepository, ensure_id, newest_first};
use crate::error::JobsError;
use crate::types::{JobInfo, JobMessage, JobStatus};

/// Job repository backed by a concurrent map. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemJobRepository {
    jobs: DashMap<String, JobInfo>,
}

impl InMemJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted<F>(&self, filter: F) -> Vec<JobInfo>
    where
        F: Fn(&JobInfo) -> bool,
    {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(newest_first);
        jobs
    }
}

#[async_trait]
impl JobRepository for InMemJobRepository {
    async fn create_or_update(&self, job: JobInfo) -> Result<JobInfo, JobsError> {
        ensure_id(&job)?;
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn update_if_running(&self, job: JobInfo) -> Result<bool, JobsError> {
        ensure_id(&job)?;
        let id = job.id.clone();
        match self.jobs.get_mut(&id) {
            Some(mut entry) if !entry.value().is_stopped() => {
                *entry.value_mut() = job;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_dead_if_silent(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobInfo>, JobsError> {
        let Some(mut entry) = self.jobs.get_mut(id) else {
            return Ok(None);
        };
        let job = entry.value_mut();
        if job.is_stopped() || job.last_updated >= cutoff {
            return Ok(None);
        }
        job.dead(now);
        Ok(Some(job.clone()))
    }

    async fn find_one(&self, id: &str) -> Result<Option<JobInfo>, JobsError> {
        Ok(self.jobs.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_all(&self, skip: usize, limit: usize) -> Result<Vec<JobInfo>, JobsError> {
        Ok(self
            .sorted(|_| true)
            .into_iter()
            .skip(skip)
            .take(limit)
            .collect())
    }

    async fn find_latest_by(
        &self,
        job_type: &str,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        let mut jobs = self.sorted(|j| j.job_type == job_type);
        jobs.truncate(max_count);
        Ok(jobs)
    }

    async fn find_latest_finished_by(
        &self,
        job_type: &str,
        status: JobStatus,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        let mut jobs =
            self.sorted(|j| j.job_type == job_type && j.status == status && j.is_stopped());
        jobs.truncate(max_count);
        Ok(jobs)
    }

    async fn find_latest_finished_except(
        &self,
        job_type: &str,
        excluded: JobStatus,
        max_count: usize,
    ) -> Result<Vec<JobInfo>, JobsError> {
        let mut jobs =
            self.sorted(|j| j.job_type == job_type && j.status != excluded && j.is_stopped());
        jobs.truncate(max_count);
        Ok(jobs)
    }

    async fn find_latest_distinct(&self) -> Result<Vec<JobInfo>, JobsError> {
        let mut latest: HashMap<String, JobInfo> = HashMap::new();
        for job in self.sorted(|_| true) {
            latest.entry(job.job_type.clone()).or_insert(job);
        }
        let mut jobs: Vec<JobInfo> = latest.into_values().collect();
        jobs.sort_by(newest_first);
        Ok(jobs)
    }

    async fn find_by_type(&self, job_type: &str) -> Result<Vec<JobInfo>, JobsError> {
        Ok(self.sorted(|j| j.job_type == job_type))
    }

    async fn find_running_without_update_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobInfo>, JobsError> {
        Ok(self.sorted(|j| !j.is_stopped() && j.last_updated < cutoff))
    }

    async fn find_status(&self, id: &str) -> Result<Option<JobStatus>, JobsError> {
        Ok(self.jobs.get(id).map(|entry| entry.value().status))
    }

    async fn append_message(&self, id: &str, message: JobMessage) -> Result<(), JobsError> {
        // The entry guard holds the shard lock for the whole push
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.value_mut().push_message(message);
        }
        Ok(())
    }

    async fn remove_if_stopped(&self, id: &str) -> Result<(), JobsError> {
        self.jobs.remove_if(id, |_, job| job.is_stopped());
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), JobsError> {
        self.jobs.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize, JobsError> {
        Ok(self.jobs.len())
    }
}
