use crate::job::Job;
use async_trait::async_trait;
use leadflow_core::{ErrorKind, LeadflowError};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the queue should do after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Retry per the job's backoff policy.
    Backoff,
    /// Retry after exactly this delay.
    After(Duration),
    /// Fail the job now regardless of remaining attempts.
    Never,
}

/// A failed run, as reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub error: String,
    pub kind: ErrorKind,
    pub directive: RetryDirective,
}

impl JobFailure {
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: ErrorKind::Overloaded,
            directive: RetryDirective::Backoff,
        }
    }

    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: ErrorKind::Fatal,
            directive: RetryDirective::Never,
        }
    }

    pub fn with_directive(mut self, directive: RetryDirective) -> Self {
        self.directive = directive;
        self
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error, self.kind)
    }
}

/// Errors are retried under the queue policy; handlers that know better
/// set the directive explicitly.
impl From<LeadflowError> for JobFailure {
    fn from(err: LeadflowError) -> Self {
        Self {
            error: err.to_string(),
            kind: err.kind(),
            directive: RetryDirective::Backoff,
        }
    }
}

/// Shared progress cell for a running job.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle(Arc<AtomicU8>);

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clamped to 100.
    pub fn set(&self, percent: u8) {
        self.0.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a handler sees for one run.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Snapshot taken when the run started; `attempts` already counts this run.
    pub job: Job,
    pub progress: ProgressHandle,
}

/// Processes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, JobFailure>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobFailure>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
