use crate::handler::JobHandler;
use crate::job::{Job, JobId, JobOptions, QueueStats};
use async_trait::async_trait;
use leadflow_core::LeadflowResult;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Which backend variant serves the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Broker-backed, survives process restarts.
    Durable,
    /// In-process emulation, lost on exit.
    Ephemeral,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Durable => write!(f, "durable"),
            BackendKind::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

/// What a backend actually promises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Guarantees {
    /// Jobs survive a process restart.
    pub durable: bool,
    /// At most `concurrency` jobs of one type run at once.
    pub concurrency_capped: bool,
    /// Delays are tracked by the backend rather than in-process timers.
    pub native_delay: bool,
}

/// A queue store plus dispatcher.
///
/// Both variants implement the same contract so callers never branch on
/// which one is active.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn guarantees(&self) -> Guarantees;

    async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> LeadflowResult<Job>;

    /// Start dispatching jobs of `job_type` on `queue` to `handler`.
    async fn process(
        &self,
        queue: &str,
        job_type: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> LeadflowResult<()>;

    async fn get_stats(&self, queue: &str) -> LeadflowResult<QueueStats>;

    async fn get_job(&self, queue: &str, id: JobId) -> LeadflowResult<Option<Job>>;

    async fn pause(&self, queue: &str) -> LeadflowResult<()>;

    async fn resume(&self, queue: &str) -> LeadflowResult<()>;

    /// Remove completed and failed jobs that finished more than `grace` ago.
    async fn clean(&self, queue: &str, grace: Duration) -> LeadflowResult<usize>;

    /// Stop dispatching. Running jobs are not awaited.
    async fn close(&self) -> LeadflowResult<()>;

    /// Every queue this backend has seen.
    fn queue_names(&self) -> Vec<String>;
}
