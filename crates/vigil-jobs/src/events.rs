//! Fire-and-forget job lifecycle notifications.
//!
//! Events exist for UIs and telemetry only. Publishing never fails from the
//! job's point of view: a sink with no listeners simply drops the event.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Level, SharedJob};

/// Default capacity of the broadcast channel behind [`BroadcastEventSink`].
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Lifecycle state reported to the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Create,
    Restart,
    Stop,
    Dead,
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Message { level: Level, text: String },
    StateChanged { state: JobState },
}

/// A job event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub job_type: String,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

/// Receiver of job events.
pub trait JobEventSink: Send + Sync {
    fn publish(&self, event: JobEvent);
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl JobEventSink for NoopEventSink {
    fn publish(&self, _event: JobEvent) {}
}

/// Fans events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<JobEvent>,
}

impl BroadcastEventSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl JobEventSink for BroadcastEventSink {
    fn publish(&self, event: JobEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("no job event subscribers");
        }
    }
}

/// Handle given to job callbacks for reporting progress.
///
/// Messages are recorded on the job itself and forwarded to the sink.
#[derive(Clone)]
pub struct JobEventPublisher {
    job: SharedJob,
    sink: Arc<dyn JobEventSink>,
}

impl JobEventPublisher {
    pub fn new(job: SharedJob, sink: Arc<dyn JobEventSink>) -> Self {
        Self { job, sink }
    }

    pub fn info(&self, text: impl Into<String>) {
        let text = text.into();
        self.job.info(text.clone());
        self.message(Level::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        let text = text.into();
        self.job.warn(text.clone());
        self.message(Level::Warning, text);
    }

    /// Record an error. The runner treats the attempt as failed.
    pub fn error(&self, text: impl Into<String>) {
        let text = text.into();
        self.job.error(text.clone());
        self.message(Level::Error, text);
    }

    /// Forward a message to the sink without recording it on the job.
    pub fn message(&self, level: Level, text: impl Into<String>) {
        self.publish(JobEventKind::Message {
            level,
            text: text.into(),
        });
    }

    pub fn state_changed(&self, state: JobState) {
        self.publish(JobEventKind::StateChanged { state });
    }

    fn publish(&self, kind: JobEventKind) {
        self.sink.publish(JobEvent {
            job_id: self.job.id().to_string(),
            job_type: self.job.job_type().to_string(),
            kind,
        });
    }
}
