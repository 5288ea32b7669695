use crate::policy::{Backoff, QueuePolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Scheduled for later, either by the caller or by a retry backoff.
    Delayed,
}

impl JobStatus {
    /// Completed and failed jobs never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priorities are clamped to `-PRIORITY_LIMIT..=PRIORITY_LIMIT`.
pub const PRIORITY_LIMIT: i32 = 500;

/// Per-job overrides of the queue policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower runs first. Defaults to 0, clamped to [`PRIORITY_LIMIT`].
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// A unit of work owned by one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Number of runs started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub backoff: Backoff,
    /// 0-100, reported by the handler.
    pub progress: u8,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// When a delayed job becomes eligible to run.
    pub ready_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job, filling unset options from the queue policy.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: &JobOptions,
        policy: &QueuePolicy,
    ) -> Self {
        let now = Utc::now();
        let mut job = Self {
            id: JobId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.attempts.unwrap_or(policy.default_attempts).max(1),
            priority: options.priority.unwrap_or(0).clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT),
            backoff: options.backoff.unwrap_or(policy.backoff),
            progress: 0,
            failed_reason: None,
            return_value: None,
            created_at: now,
            ready_at: None,
            processed_at: None,
            finished_at: None,
        };
        if let Some(delay) = options.delay.filter(|d| !d.is_zero()) {
            job.mark_delayed(delay);
        }
        job
    }

    /// Start a run. Increments `attempts`.
    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.processed_at = Some(Utc::now());
        self.ready_at = None;
    }

    pub fn mark_completed(&mut self, value: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.return_value = Some(value);
        self.failed_reason = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.failed_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
    }

    /// Park the job until `delay` has elapsed.
    pub fn mark_delayed(&mut self, delay: Duration) {
        self.status = JobStatus::Delayed;
        self.ready_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
    }

    pub fn mark_waiting(&mut self) {
        self.status = JobStatus::Waiting;
        self.ready_at = None;
    }

    /// Sort key for dispatch: priority, then arrival.
    pub fn dispatch_key(&self) -> (i32, DateTime<Utc>) {
        (self.priority, self.created_at)
    }
}

/// Job counts per status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: bool,
}

impl QueueStats {
    /// Jobs that have not reached a terminal state.
    pub fn pending(&self) -> usize {
        self.waiting + self.active + self.delayed
    }

    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Waiting => self.waiting += 1,
            JobStatus::Active => self.active += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Delayed => self.delayed += 1,
        }
    }
}
