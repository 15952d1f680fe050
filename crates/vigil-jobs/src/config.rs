//! Engine configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::definition::{JobMutexGroup, JobMutexGroups};
use crate::error::JobsError;
use crate::runner::PING_PERIOD;
use crate::status::{
    CalculatorRegistry, DEFAULT_CALCULATOR_KEY, WARNING_ON_LAST_JOB_FAILED, calculator_key,
};

/// Configuration of a job engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Jobs that may execute at the same time in this process.
    pub thread_count: usize,
    /// Recorded on every job started by this process.
    pub hostname: String,
    pub cleanup: CleanupConfig,
    pub status: StatusConfig,
    pub mutex_groups: Vec<JobMutexGroup>,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            thread_count: 10,
            hostname: default_hostname(),
            cleanup: CleanupConfig::default(),
            status: StatusConfig::default(),
            mutex_groups: Vec::new(),
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Finished jobs kept per job type.
    pub number_of_jobs_to_keep: usize,
    /// Skipped jobs kept per job type.
    pub number_of_skipped_jobs_to_keep: usize,
    /// Silence after which a running job is considered dead.
    pub mark_dead_after: Duration,
    /// Period of every cleanup sweep.
    pub interval: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            number_of_jobs_to_keep: 100,
            number_of_skipped_jobs_to_keep: 10,
            mark_dead_after: Duration::from_secs(30),
            interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Job type to calculator name. Keys are job types, lowercase with
    /// spaces replaced by `-`; the `default` key applies to the rest.
    pub calculator: BTreeMap<String, String>,
}

impl JobsConfig {
    /// Normalise calculator keys, fill in the default calculator and check
    /// the result against `registry`.
    pub fn validated(mut self, registry: &CalculatorRegistry) -> Result<Self, JobsError> {
        if self.thread_count == 0 {
            return Err(JobsError::Config("thread_count must be at least 1".into()));
        }
        if self.cleanup.mark_dead_after <= PING_PERIOD {
            return Err(JobsError::Config(format!(
                "mark_dead_after ({:?}) must exceed the ping period ({:?})",
                self.cleanup.mark_dead_after, PING_PERIOD
            )));
        }
        if self.cleanup.interval.is_zero() {
            return Err(JobsError::Config("cleanup interval must not be zero".into()));
        }

        let mut calculator: BTreeMap<String, String> = self
            .status
            .calculator
            .into_iter()
            .map(|(job_type, name)| (calculator_key(&job_type), name.trim().to_string()))
            .collect();
        calculator
            .entry(DEFAULT_CALCULATOR_KEY.to_string())
            .or_insert_with(|| WARNING_ON_LAST_JOB_FAILED.to_string());
        registry.validate(&calculator)?;
        self.status.calculator = calculator;

        Ok(self)
    }

    pub fn mutex_groups(&self) -> JobMutexGroups {
        JobMutexGroups::new(self.mutex_groups.clone())
    }
}
