//! Redis-backed durable queues.
//!
//! ## Key layout
//!
//! - `{prefix}:{queue}:jobs` hash of job id to JSON job record
//! - `{prefix}:{queue}:waiting:{type}` sorted set scored by priority then arrival
//! - `{prefix}:{queue}:delayed` sorted set scored by ready time (ms)
//! - `{prefix}:{queue}:leases` sorted set of active job ids scored by lease expiry (ms)
//! - `{prefix}:{queue}:status:{waiting|active|delayed}` sets used for counts
//! - `{prefix}:{queue}:done:{completed|failed}` sorted sets scored by finish time (ms)
//! - `{prefix}:{queue}:paused` flag
//!
//! Each `process` call spawns `concurrency` workers. A worker promotes due
//! delayed jobs, recovers jobs whose lease expired, then claims the next
//! waiting job with a script that pops it and takes its lease in one step.
//! The lease is renewed while the handler runs. A run settles only if its
//! lease is still held, so a crashed worker's job is retried exactly once
//! by whichever worker sweeps it first.

use crate::backend::{BackendKind, Guarantees, QueueBackend};
use crate::handler::{JobContext, JobFailure, JobHandler, ProgressHandle};
use crate::job::{Job, JobId, JobOptions, JobStatus, QueueStats, PRIORITY_LIMIT};
use crate::lifecycle::{apply_failure, Settlement};
use crate::policy::PolicySet;
use async_trait::async_trait;
use chrono::Utc;
use leadflow_core::{LeadflowError, LeadflowResult};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sorted-set score spacing between priority levels; larger than any ms timestamp.
///
/// `PRIORITY_LIMIT * PRIORITY_SPAN` plus a ms timestamp stays below 2^53, so
/// every waiting score is an exact integer.
const PRIORITY_SPAN: f64 = 1e13;

/// Failure recorded for a run whose worker stopped renewing its lease.
const STALLED_ERROR: &str = "job stalled: worker lease expired";

/// Pop the lowest-scored waiting id and lease it.
///
/// KEYS: waiting, jobs, status:waiting, status:active, leases. ARGV: lease expiry.
/// Returns `{}` when empty, `{id}` when the record is gone, else `{id, record}`.
const CLAIM_SCRIPT: &str = r"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return {}
end
local id = popped[1]
redis.call('SREM', KEYS[3], id)
local record = redis.call('HGET', KEYS[2], id)
if not record then
  return {id}
end
redis.call('SADD', KEYS[4], id)
redis.call('ZADD', KEYS[5], ARGV[1], id)
return {id, record}
";

/// Release a lease and place the job in its next set, if the lease is still held.
///
/// KEYS: leases, jobs, status:active, destination set, optional status set.
/// ARGV: id, record, destination score. Returns 1 when settled.
const SETTLE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
if KEYS[5] then
  redis.call('SADD', KEYS[5], ARGV[1])
end
return 1
";

fn redis_err(context: &str, err: redis::RedisError) -> LeadflowError {
    LeadflowError::Queue(format!("Redis {context} failed: {err}"))
}

/// Connection settings for the durable backend.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub key_prefix: String,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// A running job whose lease is not renewed within this window is retried.
    pub lease: Duration,
}

#[derive(Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn jobs(&self, queue: &str) -> String {
        format!("{}:{queue}:jobs", self.prefix)
    }

    fn waiting(&self, queue: &str, job_type: &str) -> String {
        format!("{}:{queue}:waiting:{job_type}", self.prefix)
    }

    fn delayed(&self, queue: &str) -> String {
        format!("{}:{queue}:delayed", self.prefix)
    }

    fn leases(&self, queue: &str) -> String {
        format!("{}:{queue}:leases", self.prefix)
    }

    fn status(&self, queue: &str, status: JobStatus) -> String {
        format!("{}:{queue}:status:{status}", self.prefix)
    }

    fn done(&self, queue: &str, status: JobStatus) -> String {
        format!("{}:{queue}:done:{status}", self.prefix)
    }

    fn paused(&self, queue: &str) -> String {
        format!("{}:{queue}:paused", self.prefix)
    }

    /// Queue name of a `leases` key, if it is one of ours.
    fn queue_of_leases<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(':')?
            .strip_suffix(":leases")
    }
}

fn waiting_score(job: &Job) -> f64 {
    let priority = job.priority.clamp(-PRIORITY_LIMIT, PRIORITY_LIMIT);
    f64::from(priority) * PRIORITY_SPAN + job.created_at.timestamp_millis() as f64
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Where a job id lives for its status.
struct Placement {
    set: String,
    score: f64,
    status_set: Option<String>,
}

struct Shared {
    conn: MultiplexedConnection,
    keys: Keys,
    policies: PolicySet,
    poll_interval: Duration,
    lease: Duration,
    claim_script: Script,
    settle_script: Script,
    shutdown: watch::Sender<bool>,
    queues: Mutex<BTreeSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Queue backend storing jobs in Redis.
#[derive(Clone)]
pub struct RedisBackend {
    shared: Arc<Shared>,
}

impl RedisBackend {
    /// Open a client, connect within the timeout and `PING`, then recover
    /// jobs left active by workers that are gone.
    pub async fn connect(settings: RedisSettings, policies: PolicySet) -> LeadflowResult<Self> {
        let client = redis::Client::open(settings.url.as_str()).map_err(|e| redis_err("open", e))?;

        let mut conn = tokio::time::timeout(
            settings.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            LeadflowError::Queue(format!(
                "Redis connect to {} timed out after {:?}",
                settings.url, settings.connect_timeout
            ))
        })?
        .map_err(|e| redis_err("connect", e))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("PING", e))?;
        debug!(reply = %pong, "Redis reachable");

        let (shutdown, _) = watch::channel(false);
        let backend = Self {
            shared: Arc::new(Shared {
                conn,
                keys: Keys {
                    prefix: settings.key_prefix,
                },
                policies,
                poll_interval: settings.poll_interval,
                lease: settings.lease,
                claim_script: Script::new(CLAIM_SCRIPT),
                settle_script: Script::new(SETTLE_SCRIPT),
                shutdown,
                queues: Mutex::new(BTreeSet::new()),
                workers: Mutex::new(Vec::new()),
            }),
        };
        if let Err(e) = backend.shared.recover_all().await {
            warn!(error = %e, "Stalled job recovery at startup failed");
        }
        Ok(backend)
    }
}

impl Shared {
    fn touch(&self, queue: &str) {
        self.queues.lock().insert(queue.to_string());
    }

    fn lease_ms(&self) -> i64 {
        i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX)
    }

    async fn load(&self, queue: &str, id: &str) -> LeadflowResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.jobs(queue))
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("HGET", e))?;
        raw.map(|s| serde_json::from_str(&s).map_err(LeadflowError::from))
            .transpose()
    }

    /// Active jobs have no placement; they are tracked by their lease.
    fn placement(&self, job: &Job) -> Option<Placement> {
        let queue = job.queue.as_str();
        match job.status {
            JobStatus::Waiting => Some(Placement {
                set: self.keys.waiting(queue, &job.job_type),
                score: waiting_score(job),
                status_set: Some(self.keys.status(queue, JobStatus::Waiting)),
            }),
            JobStatus::Delayed => Some(Placement {
                set: self.keys.delayed(queue),
                score: job.ready_at.map_or_else(now_ms, |at| at.timestamp_millis()) as f64,
                status_set: Some(self.keys.status(queue, JobStatus::Delayed)),
            }),
            JobStatus::Completed | JobStatus::Failed => Some(Placement {
                set: self.keys.done(queue, job.status),
                score: job.finished_at.map_or_else(now_ms, |at| at.timestamp_millis()) as f64,
                status_set: None,
            }),
            JobStatus::Active => None,
        }
    }

    /// Write the record of a job nobody holds a lease on and move its id
    /// between sets atomically.
    async fn transition(&self, job: &Job, from: Option<JobStatus>) -> LeadflowResult<()> {
        let queue = job.queue.as_str();
        let id = job.id.to_string();
        let record = serde_json::to_string(job)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.keys.jobs(queue))
            .arg(&id)
            .arg(record)
            .ignore();
        if let Some(from) = from {
            pipe.cmd("SREM").arg(self.keys.status(queue, from)).arg(&id).ignore();
        }
        if let Some(place) = self.placement(job) {
            pipe.cmd("ZADD").arg(&place.set).arg(place.score).arg(&id).ignore();
            if let Some(status_set) = &place.status_set {
                pipe.cmd("SADD").arg(status_set).arg(&id).ignore();
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("transition", e))
    }

    /// Move a leased job to its new status. Returns `false` when the lease
    /// was already released, in which case nothing is written.
    async fn settle(&self, job: &Job) -> LeadflowResult<bool> {
        let Some(place) = self.placement(job) else {
            return Err(LeadflowError::Queue(format!(
                "job {} cannot settle while active",
                job.id
            )));
        };
        let queue = job.queue.as_str();
        let mut invocation = self.settle_script.key(self.keys.leases(queue));
        invocation
            .key(self.keys.jobs(queue))
            .key(self.keys.status(queue, JobStatus::Active))
            .key(&place.set);
        if let Some(status_set) = &place.status_set {
            invocation.key(status_set);
        }
        invocation
            .arg(job.id.to_string())
            .arg(serde_json::to_string(job)?)
            .arg(place.score);

        let mut conn = self.conn.clone();
        let settled: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("settle", e))?;
        Ok(settled == 1)
    }

    /// Push the lease of a running job forward. Only existing leases are renewed.
    async fn renew_lease(&self, job: &Job) -> LeadflowResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(self.keys.leases(&job.queue))
            .arg("XX")
            .arg(now_ms() + self.lease_ms())
            .arg(job.id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("ZADD", e))
    }

    /// Move delayed jobs whose ready time has passed back to waiting.
    async fn promote_due(&self, queue: &str) -> LeadflowResult<()> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.delayed(queue))
            .arg("-inf")
            .arg(now_ms())
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("ZRANGEBYSCORE", e))?;

        for id in due {
            // Whoever removes the member owns the promotion.
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.keys.delayed(queue))
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("ZREM", e))?;
            if removed == 0 {
                continue;
            }
            if let Some(mut job) = self.load(queue, &id).await? {
                job.mark_waiting();
                self.transition(&job, Some(JobStatus::Delayed)).await?;
            }
        }
        Ok(())
    }

    /// Settle every job of `queue` whose lease has expired. A recorded run
    /// counts as a failed attempt; a claim that never recorded its run goes
    /// back to waiting as is. Returns how many jobs were recovered.
    async fn recover_stalled(&self, queue: &str) -> LeadflowResult<usize> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.keys.leases(queue))
            .arg("-inf")
            .arg(now_ms())
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("ZRANGEBYSCORE", e))?;

        let mut recovered = 0;
        for id in expired {
            let job = self.load(queue, &id).await?;
            let Some(mut job) = job.filter(|job| matches!(job.status, JobStatus::Active | JobStatus::Waiting)) else {
                self.release(queue, &id).await?;
                continue;
            };
            let settlement = match job.status {
                JobStatus::Active => Some(apply_failure(&mut job, &JobFailure::retry(STALLED_ERROR))),
                _ => None,
            };
            if !self.settle(&job).await? {
                continue;
            }
            recovered += 1;
            warn!(
                queue,
                job_id = %id,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                status = %job.status,
                "Recovered stalled job"
            );
            if settlement == Some(Settlement::Failed) {
                let keep = self.policies.for_queue(queue).retention.keep_failed;
                self.trim(queue, JobStatus::Failed, keep).await?;
            }
        }
        Ok(recovered)
    }

    /// Drop a lease and active membership that no longer match a record.
    async fn release(&self, queue: &str, id: &str) -> LeadflowResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.keys.leases(queue))
            .arg(id)
            .ignore()
            .cmd("SREM")
            .arg(self.keys.status(queue, JobStatus::Active))
            .arg(id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("release", e))
    }

    /// Queues under this prefix that have leases.
    async fn leased_queues(&self) -> LeadflowResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*:leases", self.keys.prefix);
        let mut queues = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("SCAN", e))?;
            queues.extend(keys.iter().filter_map(|key| self.keys.queue_of_leases(key)).map(str::to_string));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(queues.into_iter().collect())
    }

    async fn recover_all(&self) -> LeadflowResult<()> {
        for queue in self.leased_queues().await? {
            let recovered = self.recover_stalled(&queue).await?;
            if recovered > 0 {
                info!(queue = %queue, recovered, "Recovered jobs left active by a previous worker");
            }
            self.touch(&queue);
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> LeadflowResult<bool> {
        let mut conn = self.conn.clone();
        redis::cmd("EXISTS")
            .arg(self.keys.paused(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("EXISTS", e))
    }

    /// Claim the next waiting job of `job_type`, marking it active under a lease.
    async fn claim(&self, queue: &str, job_type: &str) -> LeadflowResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let claimed: Vec<String> = self
            .claim_script
            .key(self.keys.waiting(queue, job_type))
            .key(self.keys.jobs(queue))
            .key(self.keys.status(queue, JobStatus::Waiting))
            .key(self.keys.status(queue, JobStatus::Active))
            .key(self.keys.leases(queue))
            .arg(now_ms() + self.lease_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("claim", e))?;

        let mut claimed = claimed.into_iter();
        let Some(id) = claimed.next() else {
            return Ok(None);
        };
        let Some(record) = claimed.next() else {
            warn!(queue, job_id = %id, "Claimed job has no record, dropping");
            return Ok(None);
        };
        let mut job: Job = serde_json::from_str(&record)?;
        job.mark_active();
        // Until this lands the record still says waiting; an expired lease
        // then requeues the job without charging an attempt.
        redis::cmd("HSET")
            .arg(self.keys.jobs(queue))
            .arg(&id)
            .arg(serde_json::to_string(&job)?)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("HSET", e))?;
        Ok(Some(job))
    }

    /// Drop the oldest finished jobs beyond the retention limit.
    async fn trim(&self, queue: &str, status: JobStatus, keep: usize) -> LeadflowResult<()> {
        let mut conn = self.conn.clone();
        let stop = -(keep as i64) - 1;
        let old: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.keys.done(queue, status))
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("ZRANGE", e))?;
        if old.is_empty() {
            return Ok(());
        }
        self.remove(queue, status, &old).await
    }

    async fn remove(&self, queue: &str, status: JobStatus, ids: &[String]) -> LeadflowResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.keys.done(queue, status))
            .arg(ids)
            .ignore()
            .cmd("HDEL")
            .arg(self.keys.jobs(queue))
            .arg(ids)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("remove", e))
    }

    async fn run_one(&self, mut job: Job, handler: &Arc<dyn JobHandler>) -> LeadflowResult<()> {
        let queue = job.queue.clone();
        let progress = ProgressHandle::new();
        let mut work = handler.handle(JobContext {
            job: job.clone(),
            progress: progress.clone(),
        });
        let mut heartbeat = tokio::time::interval((self.lease / 3).max(Duration::from_millis(10)));
        heartbeat.tick().await;
        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.renew_lease(&job).await {
                        warn!(queue = %queue, job_id = %job.id, error = %e, "Lease renewal failed");
                    }
                }
            }
        };
        job.progress = progress.get();

        let failure = match outcome {
            Ok(value) => {
                job.mark_completed(value);
                None
            }
            Err(failure) => Some((apply_failure(&mut job, &failure), failure)),
        };
        if !self.settle(&job).await? {
            warn!(
                queue = %queue,
                job_id = %job.id,
                status = %job.status,
                "Lease expired while the job ran, result dropped"
            );
            return Ok(());
        }

        let retention = self.policies.for_queue(&queue).retention;
        match failure {
            None => {
                info!(queue = %queue, job_id = %job.id, attempts = job.attempts, "Job completed");
                self.trim(&queue, JobStatus::Completed, retention.keep_completed).await
            }
            Some((Settlement::Retry(delay), failure)) => {
                warn!(
                    queue = %queue,
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Job failed, retrying"
                );
                Ok(())
            }
            Some((Settlement::Failed, failure)) => {
                error!(
                    queue = %queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %failure,
                    "Job failed permanently"
                );
                self.trim(&queue, JobStatus::Failed, retention.keep_failed).await
            }
        }
    }

    /// Poll one step. Returns whether a job was processed.
    async fn tick(&self, queue: &str, job_type: &str, handler: &Arc<dyn JobHandler>) -> LeadflowResult<bool> {
        if self.is_paused(queue).await? {
            return Ok(false);
        }
        self.promote_due(queue).await?;
        self.recover_stalled(queue).await?;
        match self.claim(queue, job_type).await? {
            Some(job) => {
                self.run_one(job, handler).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    queue: String,
    job_type: String,
    handler: Arc<dyn JobHandler>,
    worker: usize,
) {
    let mut shutdown = shared.shutdown.subscribe();
    debug!(queue = %queue, job_type = %job_type, worker, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let busy = match shared.tick(&queue, &job_type, &handler).await {
            Ok(busy) => busy,
            Err(e) => {
                error!(queue = %queue, worker, error = %e, "Worker poll failed");
                false
            }
        };
        if busy {
            continue;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(shared.poll_interval) => {}
        }
    }
    debug!(queue = %queue, worker, "Worker stopped");
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Durable
    }

    fn guarantees(&self) -> Guarantees {
        Guarantees {
            durable: true,
            concurrency_capped: true,
            native_delay: true,
        }
    }

    async fn add_job(
        &self,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> LeadflowResult<Job> {
        if *self.shared.shutdown.borrow() {
            return Err(LeadflowError::Queue(format!(
                "Queue {queue} is closed, cannot add {job_type}"
            )));
        }
        let policy = self.shared.policies.for_queue(queue);
        let job = Job::new(queue, job_type, payload, &options, &policy);
        self.shared.transition(&job, None).await?;
        self.shared.touch(queue);
        debug!(queue, job_type, job_id = %job.id, status = %job.status, "Job added");
        Ok(job)
    }

    async fn process(
        &self,
        queue: &str,
        job_type: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> LeadflowResult<()> {
        self.shared.touch(queue);
        let concurrency = concurrency.max(1);
        let mut workers = self.shared.workers.lock();
        for worker in 0..concurrency {
            workers.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                queue.to_string(),
                job_type.to_string(),
                Arc::clone(&handler),
                worker,
            )));
        }
        info!(queue, job_type, concurrency, "Redis workers started");
        Ok(())
    }

    async fn get_stats(&self, queue: &str) -> LeadflowResult<QueueStats> {
        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let (waiting, active, delayed, completed, failed, paused): (usize, usize, usize, usize, usize, bool) =
            redis::pipe()
                .cmd("SCARD")
                .arg(keys.status(queue, JobStatus::Waiting))
                .cmd("SCARD")
                .arg(keys.status(queue, JobStatus::Active))
                .cmd("SCARD")
                .arg(keys.status(queue, JobStatus::Delayed))
                .cmd("ZCARD")
                .arg(keys.done(queue, JobStatus::Completed))
                .cmd("ZCARD")
                .arg(keys.done(queue, JobStatus::Failed))
                .cmd("EXISTS")
                .arg(keys.paused(queue))
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("stats", e))?;
        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused,
        })
    }

    async fn get_job(&self, queue: &str, id: JobId) -> LeadflowResult<Option<Job>> {
        self.shared.load(queue, &id.to_string()).await
    }

    async fn pause(&self, queue: &str) -> LeadflowResult<()> {
        let mut conn = self.shared.conn.clone();
        redis::cmd("SET")
            .arg(self.shared.keys.paused(queue))
            .arg(1)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("SET", e))?;
        info!(queue, "Queue paused");
        Ok(())
    }

    async fn resume(&self, queue: &str) -> LeadflowResult<()> {
        let mut conn = self.shared.conn.clone();
        redis::cmd("DEL")
            .arg(self.shared.keys.paused(queue))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("DEL", e))?;
        info!(queue, "Queue resumed");
        Ok(())
    }

    async fn clean(&self, queue: &str, grace: Duration) -> LeadflowResult<usize> {
        let cutoff = now_ms() - grace.as_millis() as i64;
        let mut conn = self.shared.conn.clone();
        let mut removed = 0;
        for status in [JobStatus::Completed, JobStatus::Failed] {
            let old: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.shared.keys.done(queue, status))
                .arg("-inf")
                .arg(cutoff)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("ZRANGEBYSCORE", e))?;
            if !old.is_empty() {
                self.shared.remove(queue, status, &old).await?;
                removed += old.len();
            }
        }
        info!(queue, removed, "Queue cleaned");
        Ok(removed)
    }

    async fn close(&self) -> LeadflowResult<()> {
        self.shared.shutdown.send_replace(true);
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        info!(workers = workers.len(), "Redis queue closed");
        Ok(())
    }

    fn queue_names(&self) -> Vec<String> {
        self.shared.queues.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::QueuePolicy;

    #[test]
    fn test_key_layout() {
        let keys = Keys {
            prefix: "leadflow".into(),
        };
        assert_eq!(keys.jobs("ai-processing"), "leadflow:ai-processing:jobs");
        assert_eq!(
            keys.waiting("ai-processing", "process-lead"),
            "leadflow:ai-processing:waiting:process-lead"
        );
        assert_eq!(
            keys.status("analytics", JobStatus::Delayed),
            "leadflow:analytics:status:delayed"
        );
        assert_eq!(
            keys.done("analytics", JobStatus::Failed),
            "leadflow:analytics:done:failed"
        );
        assert_eq!(keys.leases("ai-processing"), "leadflow:ai-processing:leases");
        assert_eq!(keys.queue_of_leases("leadflow:ai-processing:leases"), Some("ai-processing"));
        assert_eq!(keys.queue_of_leases("leadflow:ai-processing:jobs"), None);
        assert_eq!(keys.queue_of_leases("staging:ai-processing:leases"), None);
    }

    #[test]
    fn test_priority_dominates_arrival() {
        let policy = QueuePolicy::default();
        let urgent = Job::new("q", "t", serde_json::Value::Null, &JobOptions::default().with_priority(-1), &policy);
        let normal = Job::new("q", "t", serde_json::Value::Null, &JobOptions::default(), &policy);
        assert!(waiting_score(&urgent) < waiting_score(&normal));
    }

    #[test]
    fn test_arrival_order_is_exact_at_priority_limits() {
        let policy = QueuePolicy::default();
        for priority in [-PRIORITY_LIMIT, 0, PRIORITY_LIMIT] {
            let options = JobOptions::default().with_priority(priority);
            let first = Job::new("q", "t", serde_json::Value::Null, &options, &policy);
            let mut second = first.clone();
            second.created_at = first.created_at + chrono::Duration::milliseconds(1);
            assert_eq!(waiting_score(&second) - waiting_score(&first), 1.0);
        }
    }

    #[test]
    fn test_out_of_range_record_priority_is_clamped() {
        let policy = QueuePolicy::default();
        let mut job = Job::new("q", "t", serde_json::Value::Null, &JobOptions::default(), &policy);
        job.priority = i32::MAX;
        let mut edge = job.clone();
        edge.priority = PRIORITY_LIMIT;
        assert_eq!(waiting_score(&job), waiting_score(&edge));
        assert!(waiting_score(&job) < 2f64.powi(53));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let settings = RedisSettings {
            url: "redis://127.0.0.1:1/".into(),
            key_prefix: "leadflow".into(),
            poll_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(300),
            lease: Duration::from_secs(30),
        };
        let err = RedisBackend::connect(settings, PolicySet::default()).await.err();
        assert!(matches!(err, Some(LeadflowError::Queue(_))));
    }
}
