//! In-process queue emulation used when no broker is reachable.
//!
//! Jobs live in a map per queue and are dispatched onto the tokio runtime as
//! soon as they are waiting and a handler is registered. Delays are tokio
//! timers. Concurrency is not capped: every ready job gets its own task.

use crate::backend::{BackendKind, Guarantees, QueueBackend};
use crate::handler::{JobContext, JobHandler, ProgressHandle};
use crate::job::{Job, JobId, JobOptions, JobStatus, QueueStats};
use crate::lifecycle::{apply_failure, overflow, Settlement};
use crate::policy::PolicySet;
use async_trait::async_trait;
use chrono::Utc;
use leadflow_core::{LeadflowError, LeadflowResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    progress: HashMap<JobId, ProgressHandle>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    paused: bool,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    policies: PolicySet,
    closed: AtomicBool,
}

/// Queue backend that keeps everything in process memory.
#[derive(Clone)]
pub struct EphemeralBackend {
    inner: Arc<Inner>,
}

impl EphemeralBackend {
    pub fn new(policies: PolicySet) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                policies,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Default for EphemeralBackend {
    fn default() -> Self {
        Self::new(PolicySet::default())
    }
}

/// Start a waiting job if the queue is running and has a handler for it.
fn dispatch(inner: &Arc<Inner>, queue: &str, id: JobId) {
    if inner.closed.load(Ordering::SeqCst) {
        return;
    }

    let (job, handler, progress) = {
        let mut queues = inner.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return;
        };
        if state.paused {
            return;
        }
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };
        if job.status != JobStatus::Waiting {
            return;
        }
        let Some(handler) = state.handlers.get(&job.job_type).cloned() else {
            return;
        };
        job.mark_active();
        let progress = ProgressHandle::new();
        let snapshot = job.clone();
        state.progress.insert(id, progress.clone());
        (snapshot, handler, progress)
    };

    debug!(queue, job_id = %id, attempt = job.attempts, "Dispatching job");
    let inner = Arc::clone(inner);
    let queue = queue.to_string();
    tokio::spawn(run(inner, queue, job, handler, progress));
}

async fn run(
    inner: Arc<Inner>,
    queue: String,
    job: Job,
    handler: Arc<dyn JobHandler>,
    progress: ProgressHandle,
) {
    let id = job.id;
    let outcome = handler
        .handle(JobContext {
            job,
            progress: progress.clone(),
        })
        .await;

    let retry_after = {
        let mut queues = inner.queues.lock();
        let Some(state) = queues.get_mut(&queue) else {
            return;
        };
        state.progress.remove(&id);
        let retention = inner.policies.for_queue(&queue).retention;
        let Some(job) = state.jobs.get_mut(&id) else {
            // Cleaned while running.
            return;
        };

        match outcome {
            Ok(value) => {
                job.mark_completed(value);
                info!(queue = %queue, job_id = %id, attempts = job.attempts, "Job completed");
                state.completed.push_back(id);
                for old in overflow(&mut state.completed, retention.keep_completed) {
                    state.jobs.remove(&old);
                }
                None
            }
            Err(failure) => {
                job.progress = progress.get();
                match apply_failure(job, &failure) {
                    Settlement::Retry(delay) => {
                        warn!(
                            queue = %queue,
                            job_id = %id,
                            attempt = job.attempts,
                            max_attempts = job.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure,
                            "Job failed, retrying"
                        );
                        Some(delay)
                    }
                    Settlement::Failed => {
                        error!(
                            queue = %queue,
                            job_id = %id,
                            attempts = job.attempts,
                            error = %failure,
                            "Job failed permanently"
                        );
                        state.failed.push_back(id);
                        for old in overflow(&mut state.failed, retention.keep_failed) {
                            state.jobs.remove(&old);
                        }
                        None
                    }
                }
            }
        }
    };

    if let Some(delay) = retry_after {
        schedule(&inner, queue, id, delay);
    }
}

/// Move a delayed job back to waiting once `delay` elapses.
fn schedule(inner: &Arc<Inner>, queue: String, id: JobId, delay: Duration) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let promoted = {
            let mut queues = inner.queues.lock();
            match queues.get_mut(&queue).and_then(|s| s.jobs.get_mut(&id)) {
                Some(job) if job.status == JobStatus::Delayed => {
                    job.mark_waiting();
                    true
                }
                _ => false,
            }
        };
        if promoted {
            dispatch(&inner, &queue, id);
        }
    });
}

/// Dispatch every waiting job of `queue` in priority-then-arrival order.
fn drain(inner: &Arc<Inner>, queue: &str) {
    let ids: Vec<JobId> = {
        let queues = inner.queues.lock();
        let Some(state) = queues.get(queue) else {
            return;
        };
        let mut waiting: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Waiting)
            .collect();
        waiting.sort_by_key(|j| j.dispatch_key());
        waiting.into_iter().map(|j| j.id).collect()
    };
    for id in ids {
        dispatch(inner, queue, id);
    }
}

#[async_trait]
impl QueueBackend for EphemeralBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ephemeral
    }

    fn guarantees(&self) -> Guarantees {
        Guarantees {
            durable: false,
            concurrency_capped: false,
            native_delay: false,
        }
    }

    async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> LeadflowResult<Job> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LeadflowError::Queue(format!(
                "Queue {queue} is closed, cannot add {job_type}"
            )));
        }

        let policy = self.inner.policies.for_queue(queue);
        let job = Job::new(queue, job_type, payload, &options, &policy);
        let id = job.id;
        let delayed = job.status == JobStatus::Delayed;

        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .jobs
            .insert(id, job.clone());
        debug!(queue, job_type, job_id = %id, delayed, "Job added");

        if delayed {
            let delay = options.delay.unwrap_or_default();
            schedule(&self.inner, queue.to_string(), id, delay);
        } else {
            dispatch(&self.inner, queue, id);
        }
        Ok(job)
    }

    async fn process(
        &self,
        queue: &str,
        job_type: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> LeadflowResult<()> {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .handlers
            .insert(job_type.to_string(), handler);
        info!(queue, job_type, concurrency, "Processing in-process (concurrency not capped)");
        drain(&self.inner, queue);
        Ok(())
    }

    async fn get_stats(&self, queue: &str) -> LeadflowResult<QueueStats> {
        let queues = self.inner.queues.lock();
        let mut stats = QueueStats::default();
        if let Some(state) = queues.get(queue) {
            for job in state.jobs.values() {
                stats.record(job.status);
            }
            stats.paused = state.paused;
        }
        Ok(stats)
    }

    async fn get_job(&self, queue: &str, id: JobId) -> LeadflowResult<Option<Job>> {
        let queues = self.inner.queues.lock();
        let Some(state) = queues.get(queue) else {
            return Ok(None);
        };
        Ok(state.jobs.get(&id).map(|job| {
            let mut job = job.clone();
            if let Some(progress) = state.progress.get(&id) {
                job.progress = progress.get();
            }
            job
        }))
    }

    async fn pause(&self, queue: &str) -> LeadflowResult<()> {
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .paused = true;
        info!(queue, "Queue paused");
        Ok(())
    }

    async fn resume(&self, queue: &str) -> LeadflowResult<()> {
        if let Some(state) = self.inner.queues.lock().get_mut(queue) {
            state.paused = false;
        }
        info!(queue, "Queue resumed");
        drain(&self.inner, queue);
        Ok(())
    }

    async fn clean(&self, queue: &str, grace: Duration) -> LeadflowResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let mut queues = self.inner.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.finished_at.is_some_and(|at| at <= cutoff))
        });
        let QueueState {
            jobs,
            completed,
            failed,
            ..
        } = state;
        completed.retain(|id| jobs.contains_key(id));
        failed.retain(|id| jobs.contains_key(id));

        let removed = before - jobs.len();
        info!(queue, removed, "Queue cleaned");
        Ok(removed)
    }

    async fn close(&self) -> LeadflowResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        info!("In-process queue closed");
        Ok(())
    }

    fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, JobFailure};

    #[tokio::test]
    async fn test_jobs_wait_until_a_handler_is_registered() {
        let backend = EphemeralBackend::default();
        let job = backend
            .add_job("analytics", "track", serde_json::json!({"event": "lead"}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(backend.get_stats("analytics").await.unwrap().waiting, 1);

        backend
            .process(
                "analytics",
                "track",
                1,
                handler_fn(|_ctx| async { Ok(serde_json::json!("tracked")) }),
            )
            .await
            .unwrap();

        for _ in 0..50 {
            if backend.get_stats("analytics").await.unwrap().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let done = backend.get_job("analytics", job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.return_value, Some(serde_json::json!("tracked")));
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_jobs() {
        let backend = EphemeralBackend::default();
        backend.close().await.unwrap();
        let err = backend
            .add_job("q", "t", serde_json::Value::Null, JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::Queue(_)));
    }

    #[tokio::test]
    async fn test_pause_holds_jobs() {
        let backend = EphemeralBackend::default();
        backend.pause("q").await.unwrap();
        backend
            .process("q", "t", 1, handler_fn(|_| async { Err(JobFailure::fatal("never")) }))
            .await
            .unwrap();
        backend
            .add_job("q", "t", serde_json::Value::Null, JobOptions::default())
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let stats = backend.get_stats("q").await.unwrap();
        assert!(stats.paused);
        assert_eq!(stats.waiting, 1);
        assert_eq!(backend.queue_names(), vec!["q".to_string()]);
    }
}
