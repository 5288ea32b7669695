//! Queue manager: backend selection at startup plus a handler registry.

use crate::backend::{BackendKind, Guarantees, QueueBackend};
use crate::ephemeral::EphemeralBackend;
use crate::handler::{JobContext, JobFailure, JobHandler, ProgressHandle};
use crate::job::{Job, JobId, JobOptions, QueueStats};
use crate::policy::PolicySet;
use leadflow_core::{LeadflowError, LeadflowResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Queue subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker URL. `None` selects the in-process backend directly.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// How often idle durable workers poll for work.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long a durable job may go without a worker heartbeat before it
    /// counts as stalled and is retried.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default)]
    pub policies: PolicySet,
}

fn default_key_prefix() -> String {
    "leadflow".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_lease_ms() -> u64 {
    30_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            lease_ms: default_lease_ms(),
            policies: PolicySet::default(),
        }
    }
}

/// How [`QueueManager::add_job_or_run`] handled a job.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Enqueued(Job),
    /// Enqueueing failed and the registered handler ran once in the caller's task.
    RanInline {
        job: Job,
        outcome: Result<serde_json::Value, JobFailure>,
    },
}

impl Dispatch {
    pub fn job(&self) -> &Job {
        match self {
            Dispatch::Enqueued(job) | Dispatch::RanInline { job, .. } => job,
        }
    }
}

/// Owns the active queue backend and the handlers registered on it.
pub struct QueueManager {
    backend: Arc<dyn QueueBackend>,
    handlers: RwLock<HashMap<(String, String), Arc<dyn JobHandler>>>,
    policies: PolicySet,
}

impl QueueManager {
    /// Probe the broker and fall back to in-process queues when it is unreachable.
    pub async fn connect(config: QueueConfig) -> Self {
        match Self::durable(&config).await {
            Ok(Some(backend)) => {
                info!(backend = %backend.kind(), "Queue backend selected");
                return Self::with_backend(backend, config.policies);
            }
            Ok(None) => info!("No broker configured, using in-process queues"),
            Err(e) => warn!(error = %e, "Broker unreachable, falling back to in-process queues"),
        }
        Self::ephemeral(config.policies)
    }

    #[cfg(feature = "redis")]
    async fn durable(config: &QueueConfig) -> LeadflowResult<Option<Arc<dyn QueueBackend>>> {
        let Some(url) = config.redis_url.clone() else {
            return Ok(None);
        };
        let settings = crate::durable::RedisSettings {
            url,
            key_prefix: config.key_prefix.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            lease: Duration::from_millis(config.lease_ms),
        };
        let backend = crate::durable::RedisBackend::connect(settings, config.policies.clone()).await?;
        Ok(Some(Arc::new(backend)))
    }

    #[cfg(not(feature = "redis"))]
    async fn durable(config: &QueueConfig) -> LeadflowResult<Option<Arc<dyn QueueBackend>>> {
        match &config.redis_url {
            Some(_) => Err(LeadflowError::Config(
                "redis_url is set but this build has no redis support".into(),
            )),
            None => Ok(None),
        }
    }

    pub fn ephemeral(policies: PolicySet) -> Self {
        let backend: Arc<dyn QueueBackend> = Arc::new(EphemeralBackend::new(policies.clone()));
        Self::with_backend(backend, policies)
    }

    pub fn with_backend(backend: Arc<dyn QueueBackend>, policies: PolicySet) -> Self {
        Self {
            backend,
            handlers: RwLock::new(HashMap::new()),
            policies,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn guarantees(&self) -> Guarantees {
        self.backend.guarantees()
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Register `handler` for `job_type` on `queue` and start dispatching with
    /// the queue policy's concurrency.
    pub async fn process(&self, queue: &str, job_type: &str, handler: Arc<dyn JobHandler>) -> LeadflowResult<()> {
        let concurrency = self.policies.for_queue(queue).concurrency;
        self.handlers
            .write()
            .insert((queue.to_string(), job_type.to_string()), Arc::clone(&handler));
        self.backend.process(queue, job_type, concurrency, handler).await
    }

    pub async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> LeadflowResult<Job> {
        self.backend.add_job(queue, job_type, payload, options).await
    }

    /// Enqueue, or run the registered handler immediately if enqueueing fails.
    ///
    /// Errors only when enqueueing fails and no handler is registered.
    pub async fn add_job_or_run(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> LeadflowResult<Dispatch> {
        let enqueue_err = match self
            .backend
            .add_job(queue, job_type, payload.clone(), options.clone())
            .await
        {
            Ok(job) => return Ok(Dispatch::Enqueued(job)),
            Err(e) => e,
        };

        let handler = self
            .handlers
            .read()
            .get(&(queue.to_string(), job_type.to_string()))
            .cloned();
        let Some(handler) = handler else {
            error!(queue, job_type, error = %enqueue_err, "Enqueue failed and no handler registered");
            return Err(enqueue_err);
        };

        warn!(queue, job_type, error = %enqueue_err, "Enqueue failed, running job inline");
        let policy = self.policies.for_queue(queue);
        let mut job = Job::new(queue, job_type, payload, &options.with_delay(Duration::ZERO), &policy);
        job.mark_active();
        let progress = ProgressHandle::new();
        let outcome = handler
            .handle(JobContext {
                job: job.clone(),
                progress: progress.clone(),
            })
            .await;
        job.progress = progress.get();
        match &outcome {
            Ok(value) => job.mark_completed(value.clone()),
            Err(failure) => job.mark_failed(failure.error.clone()),
        }
        Ok(Dispatch::RanInline { job, outcome })
    }

    pub async fn get_stats(&self, queue: &str) -> LeadflowResult<QueueStats> {
        self.backend.get_stats(queue).await
    }

    pub async fn get_job(&self, queue: &str, id: JobId) -> LeadflowResult<Option<Job>> {
        self.backend.get_job(queue, id).await
    }

    pub async fn pause(&self, queue: &str) -> LeadflowResult<()> {
        self.backend.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> LeadflowResult<()> {
        self.backend.resume(queue).await
    }

    pub async fn clean(&self, queue: &str, grace: Duration) -> LeadflowResult<usize> {
        self.backend.clean(queue, grace).await
    }

    pub async fn close(&self) -> LeadflowResult<()> {
        self.backend.close().await
    }

    /// Poll until `queue` has no waiting, active or delayed jobs, or `limit` elapses.
    pub async fn wait_idle(&self, queue: &str, poll: Duration, limit: Duration) -> LeadflowResult<QueueStats> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let stats = self.get_stats(queue).await?;
            if stats.pending() == 0 {
                return Ok(stats);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LeadflowError::Queue(format!(
                    "Queue {queue} still has {} pending jobs after {limit:?}",
                    stats.pending()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Backend description and per-queue counts.
    pub async fn stats_json(&self) -> LeadflowResult<serde_json::Value> {
        let mut queues = serde_json::Map::new();
        for name in self.backend.queue_names() {
            let stats = self.backend.get_stats(&name).await?;
            queues.insert(name, serde_json::to_value(stats)?);
        }
        Ok(serde_json::json!({
            "backend": self.kind(),
            "guarantees": self.guarantees(),
            "queues": queues,
        }))
    }
}
