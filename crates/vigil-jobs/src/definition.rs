//! Static job metadata and mutual exclusion groups.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Static description of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_type: String,
    /// Human-readable name.
    pub name: String,
    pub description: String,
    /// Delay between the end of one run and the start of the next, if recurring.
    pub fixed_delay: Option<Duration>,
    /// How many times a failed run is restarted in place.
    pub restarts: u32,
    /// A finished run older than this is reported as stale.
    pub max_age: Option<Duration>,
}

impl JobDefinition {
    /// A job that is started again `delay` after each run.
    pub fn fixed_delay(
        job_type: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        delay: Duration,
        restarts: u32,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            name: name.into(),
            description: description.into(),
            fixed_delay: Some(delay),
            restarts,
            max_age,
        }
    }

    /// A job that only runs when started explicitly.
    pub fn manually_triggered(
        job_type: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        restarts: u32,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            name: name.into(),
            description: description.into(),
            fixed_delay: None,
            restarts,
            max_age,
        }
    }
}

/// A named set of job types that must never run at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMutexGroup {
    pub name: String,
    pub job_types: BTreeSet<String>,
}

impl JobMutexGroup {
    pub fn new<I, S>(name: impl Into<String>, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            job_types: job_types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.job_types.contains(job_type)
    }
}

/// All configured mutex groups.
#[derive(Debug, Clone, Default)]
pub struct JobMutexGroups {
    groups: Vec<JobMutexGroup>,
}

impl JobMutexGroups {
    pub fn new(groups: Vec<JobMutexGroup>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[JobMutexGroup] {
        &self.groups
    }

    /// The job types that must be idle before `job_type` may start,
    /// including `job_type` itself.
    pub fn mutex_job_types_for(&self, job_type: &str) -> HashSet<String> {
        let mut types: HashSet<String> = self
            .groups
            .iter()
            .filter(|g| g.contains(job_type))
            .flat_map(|g| g.job_types.iter().cloned())
            .collect();
        types.insert(job_type.to_string());
        types
    }
}
