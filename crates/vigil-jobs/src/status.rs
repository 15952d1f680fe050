//! Health of job types, derived from their recent history.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::clock::Clock;
use crate::definition::JobDefinition;
use crate::error::JobsError;
use crate::lock::JobLockRepository;
use crate::store::JobRepository;
use crate::types::{JobInfo, JobStatus};

pub const SUCCESS_MESSAGE: &str = "Last job was successful";
pub const ERROR_MESSAGE: &str = "Job had an error";
pub const JOB_TOO_OLD_MESSAGE: &str = "Job didn't run in the past ";
pub const STATUS_UNAVAILABLE_MESSAGE: &str = "could not retrieve job status";
pub const DEACTIVATED_MESSAGE: &str = "Job is deactivated: ";

pub const WARNING_ON_LAST_JOB_FAILED: &str = "warningOnLastJobFailed";
pub const ERROR_ON_LAST_JOB_FAILED: &str = "errorOnLastJobFailed";
pub const ERROR_ON_LAST_THREE_JOBS_FAILED: &str = "errorOnLastThreeJobsFailed";
pub const ERROR_ON_LAST_TEN_JOBS_FAILED: &str = "errorOnLastTenJobsFailed";

/// Key of the calculator applied to job types without their own entry.
pub const DEFAULT_CALCULATOR_KEY: &str = "default";

/// Health verdict, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Ok,
    Warning,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Status::Ok => "OK",
            Status::Warning => "WARNING",
            Status::Error => "ERROR",
        })
    }
}

/// Status of one job type, as handed to a health aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDetail {
    pub name: String,
    pub status: Status,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl StatusDetail {
    pub fn new(name: impl Into<String>, status: Status, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    fn with_details(mut self, details: BTreeMap<String, String>) -> Self {
        self.details = details;
        self
    }
}

/// The worst status among `details`, or OK if there are none.
pub fn aggregate_status(details: &[StatusDetail]) -> Status {
    details
        .iter()
        .map(|d| d.status)
        .max()
        .unwrap_or(Status::Ok)
}

/// Facts beyond the history that a calculation depends on.
#[derive(Debug, Clone)]
pub struct StatusContext {
    pub now: DateTime<Utc>,
    /// `Some` if the job type is disabled, holding the reason if one was given.
    pub disabled: Option<Option<String>>,
}

impl StatusContext {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            disabled: None,
        }
    }
}

/// A named policy turning a job type's history into a [`StatusDetail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusCalculator {
    key: String,
    /// Consecutive failures that make the job type an error. `None` means
    /// failures only ever warn.
    failures_for_error: Option<usize>,
}

impl JobStatusCalculator {
    /// WARNING if the last finished job failed.
    pub fn warning_on_last_job_failed() -> Self {
        Self {
            key: WARNING_ON_LAST_JOB_FAILED.to_string(),
            failures_for_error: None,
        }
    }

    /// ERROR if the last finished job failed.
    pub fn error_on_last_job_failed() -> Self {
        Self {
            key: ERROR_ON_LAST_JOB_FAILED.to_string(),
            failures_for_error: Some(1),
        }
    }

    /// ERROR if the last `n` finished jobs all failed, WARNING if fewer did.
    pub fn error_on_last_num_jobs_failed(key: impl Into<String>, n: usize) -> Self {
        Self {
            key: key.into(),
            failures_for_error: Some(n.max(1)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// How many finished, non-skipped runs a calculation needs to see.
    pub fn judged_runs(&self) -> usize {
        self.failures_for_error.unwrap_or(1)
    }

    /// Judge `history`, newest first.
    ///
    /// Running and skipped jobs are not judged; the newest record still
    /// provides the details so a running job stays visible.
    pub fn calculate(
        &self,
        definition: &JobDefinition,
        history: &[JobInfo],
        ctx: &StatusContext,
    ) -> StatusDetail {
        let name = definition.name.as_str();

        if let Some(comment) = &ctx.disabled {
            let reason = comment.as_deref().unwrap_or("N/A");
            return StatusDetail::new(name, Status::Ok, format!("{}{}", DEACTIVATED_MESSAGE, reason));
        }

        let Some(newest) = history.first() else {
            return StatusDetail::new(name, Status::Ok, SUCCESS_MESSAGE);
        };
        let details = details_for(newest);

        let judged: Vec<&JobInfo> = history
            .iter()
            .filter(|job| job.is_stopped() && job.status != JobStatus::Skipped)
            .collect();
        let Some(last) = judged.first() else {
            return StatusDetail::new(name, Status::Ok, SUCCESS_MESSAGE).with_details(details);
        };

        let failures = judged
            .iter()
            .take_while(|job| job.status.is_failure())
            .count();

        let (status, message) = match self.failures_for_error {
            Some(n) if failures >= n => (Status::Error, ERROR_MESSAGE.to_string()),
            _ if failures > 0 => (Status::Warning, ERROR_MESSAGE.to_string()),
            _ => match definition.max_age {
                Some(max_age) if too_old(last, max_age, ctx.now) => (
                    Status::Warning,
                    format!("{}{}", JOB_TOO_OLD_MESSAGE, format_duration(max_age)),
                ),
                _ => (Status::Ok, SUCCESS_MESSAGE.to_string()),
            },
        };
        StatusDetail::new(name, status, message).with_details(details)
    }
}

fn details_for(job: &JobInfo) -> BTreeMap<String, String> {
    let mut details = BTreeMap::new();
    details.insert("uri".to_string(), job.id.clone());
    match job.stopped {
        None => {
            details.insert("running".to_string(), job.id.clone());
        }
        Some(stopped) => {
            details.insert(
                "stopped".to_string(),
                stopped.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }
    }
    details.insert(
        "started".to_string(),
        job.started.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    if let Some(message) = job.last_message() {
        details.insert("message".to_string(), message.to_string());
    }
    details
}

fn too_old(job: &JobInfo, max_age: Duration, now: DateTime<Utc>) -> bool {
    let (Some(stopped), Ok(max_age)) = (job.stopped, chrono::Duration::from_std(max_age)) else {
        return false;
    };
    stopped + max_age < now
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Normalise a job type into a calculator mapping key.
pub fn calculator_key(job_type: &str) -> String {
    job_type.trim().to_lowercase().replace(' ', "-")
}

/// Calculators by name.
#[derive(Debug, Clone)]
pub struct CalculatorRegistry {
    calculators: HashMap<String, JobStatusCalculator>,
}

impl Default for CalculatorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            calculators: HashMap::new(),
        };
        registry.register(JobStatusCalculator::warning_on_last_job_failed());
        registry.register(JobStatusCalculator::error_on_last_job_failed());
        registry.register(JobStatusCalculator::error_on_last_num_jobs_failed(
            ERROR_ON_LAST_THREE_JOBS_FAILED,
            3,
        ));
        registry.register(JobStatusCalculator::error_on_last_num_jobs_failed(
            ERROR_ON_LAST_TEN_JOBS_FAILED,
            10,
        ));
        registry
    }
}

impl CalculatorRegistry {
    /// A registry holding the built-in calculators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a calculator under its key.
    pub fn register(&mut self, calculator: JobStatusCalculator) {
        self.calculators
            .insert(calculator.key().to_string(), calculator);
    }

    pub fn get(&self, key: &str) -> Result<&JobStatusCalculator, JobsError> {
        self.calculators
            .get(key)
            .ok_or_else(|| JobsError::Config(format!("no status calculator named '{}'", key)))
    }

    /// Check that every calculator named in `mapping` exists.
    pub fn validate(&self, mapping: &BTreeMap<String, String>) -> Result<(), JobsError> {
        for name in mapping.values() {
            self.get(name)?;
        }
        Ok(())
    }

    /// The calculator configured for `job_type`, falling back to the
    /// `default` entry and then to [`WARNING_ON_LAST_JOB_FAILED`].
    pub fn for_job_type(
        &self,
        job_type: &str,
        mapping: &BTreeMap<String, String>,
    ) -> Result<&JobStatusCalculator, JobsError> {
        let key = mapping
            .get(&calculator_key(job_type))
            .or_else(|| mapping.get(DEFAULT_CALCULATOR_KEY))
            .map(String::as_str)
            .unwrap_or(WARNING_ON_LAST_JOB_FAILED);
        self.get(key)
    }
}

/// Reports the status of one job type from the store.
pub struct JobStatusIndicator {
    definition: JobDefinition,
    calculator: JobStatusCalculator,
    repository: Arc<dyn JobRepository>,
    locks: Arc<dyn JobLockRepository>,
    clock: Arc<dyn Clock>,
}

impl JobStatusIndicator {
    pub fn new(
        definition: JobDefinition,
        calculator: JobStatusCalculator,
        repository: Arc<dyn JobRepository>,
        locks: Arc<dyn JobLockRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            definition,
            calculator,
            repository,
            locks,
            clock,
        }
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    /// Current status. Store failures become an ERROR detail.
    pub async fn status_detail(&self) -> StatusDetail {
        match self.load_context().await {
            Ok((history, ctx)) => self.calculator.calculate(&self.definition, &history, &ctx),
            Err(e) => {
                error!(job_type = %self.definition.job_type, error = %e, "could not retrieve job status");
                StatusDetail::new(&self.definition.name, Status::Error, STATUS_UNAVAILABLE_MESSAGE)
            }
        }
    }

    async fn load_context(&self) -> Result<(Vec<JobInfo>, StatusContext), JobsError> {
        let job_type = &self.definition.job_type;
        let disabled = if self.locks.find_disabled().await?.contains(job_type) {
            Some(self.locks.disable_comment(job_type).await?)
        } else {
            None
        };
        // The newest record for the details, then the runs the calculator judges
        let mut history = self.repository.find_latest_by(job_type, 1).await?;
        let judged = self
            .repository
            .find_latest_finished_except(
                job_type,
                JobStatus::Skipped,
                self.calculator.judged_runs(),
            )
            .await?;
        let newest_id = history.first().map(|job| job.id.clone());
        history.extend(
            judged
                .into_iter()
                .filter(|job| newest_id.as_deref() != Some(job.id.as_str())),
        );
        Ok((
            history,
            StatusContext {
                now: self.clock.now(),
                disabled,
            },
        ))
    }
}
