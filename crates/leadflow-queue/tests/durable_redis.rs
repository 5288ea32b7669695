#![cfg(feature = "redis")]
#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Durable backend tests against a live broker.
//!
//! Set `LEADFLOW_TEST_REDIS_URL` (for example `redis://127.0.0.1:6379/15`) to
//! run them; without it every test returns early. Each test uses its own key
//! prefix and deletes its keys afterwards.

use leadflow_queue::{
    handler_fn, Backoff, Job, JobHandler, JobId, JobOptions, JobStatus, PolicySet, QueueBackend,
    RedisBackend, RedisSettings, PRIORITY_LIMIT,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const LEASE: Duration = Duration::from_millis(300);
const QUEUE: &str = "lead-processing";
const JOB_TYPE: &str = "process-lead";

struct Broker {
    url: String,
    prefix: String,
}

impl Broker {
    fn from_env() -> Option<Self> {
        let url = std::env::var("LEADFLOW_TEST_REDIS_URL").ok().filter(|url| !url.is_empty());
        if url.is_none() {
            eprintln!("LEADFLOW_TEST_REDIS_URL not set, skipping");
        }
        Some(Self {
            url: url?,
            prefix: format!("leadflow-test-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn connect(&self) -> RedisBackend {
        let settings = RedisSettings {
            url: self.url.clone(),
            key_prefix: self.prefix.clone(),
            poll_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            lease: LEASE,
        };
        RedisBackend::connect(settings, PolicySet::default()).await.unwrap()
    }

    async fn raw(&self) -> redis::aio::MultiplexedConnection {
        redis::Client::open(self.url.as_str())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap()
    }

    async fn lease_count(&self) -> usize {
        let mut conn = self.raw().await;
        redis::cmd("ZCARD")
            .arg(format!("{}:{QUEUE}:leases", self.prefix))
            .query_async(&mut conn)
            .await
            .unwrap()
    }

    async fn cleanup(&self) {
        let mut conn = self.raw().await;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:*", self.prefix))
            .query_async(&mut conn)
            .await
            .unwrap();
        if !keys.is_empty() {
            redis::cmd("DEL")
                .arg(keys)
                .query_async::<_, ()>(&mut conn)
                .await
                .unwrap();
        }
    }
}

/// Panics on the first run, standing in for a worker process that dies mid-job.
fn crashes_on_first_run() -> Arc<dyn JobHandler> {
    handler_fn(|ctx| async move {
        assert!(ctx.job.attempts > 1, "worker crashed mid-run");
        Ok(json!({"attempt": ctx.job.attempts}))
    })
}

async fn add(backend: &RedisBackend, options: JobOptions) -> Job {
    backend
        .add_job(QUEUE, JOB_TYPE, json!({"leadId": 42}), options)
        .await
        .unwrap()
}

async fn wait_for(backend: &RedisBackend, id: JobId, status: JobStatus) -> Job {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = backend.get_job(QUEUE, id).await.unwrap().unwrap();
        if job.status == status {
            return job;
        }
        assert!(Instant::now() < deadline, "job {id} stuck in {}", job.status);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Start one worker that dies on `job`, and wait until its lease has expired.
async fn strand(broker: &Broker, job: &Job) {
    let crashed = broker.connect().await;
    crashed.process(QUEUE, JOB_TYPE, 1, crashes_on_first_run()).await.unwrap();
    wait_for(&crashed, job.id, JobStatus::Active).await;
    tokio::time::sleep(LEASE * 2).await;
    crashed.close().await.unwrap();
}

#[tokio::test]
async fn test_completed_jobs_release_their_leases() {
    let Some(broker) = Broker::from_env() else { return };
    let backend = broker.connect().await;
    backend
        .process(QUEUE, JOB_TYPE, 2, handler_fn(|_| async { Ok(json!({"ok": true})) }))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(add(&backend, JobOptions::default()).await.id);
    }
    for id in ids {
        let job = wait_for(&backend, id, JobStatus::Completed).await;
        assert_eq!(job.attempts, 1);
    }

    let stats = backend.get_stats(QUEUE).await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
    assert_eq!(broker.lease_count().await, 0);

    backend.close().await.unwrap();
    broker.cleanup().await;
}

#[tokio::test]
async fn test_stalled_job_is_recovered_on_connect() {
    let Some(broker) = Broker::from_env() else { return };
    let setup = broker.connect().await;
    let job = add(
        &setup,
        JobOptions::default().with_attempts(3).with_backoff(Backoff::fixed(10)),
    )
    .await;
    strand(&broker, &job).await;

    let restarted = broker.connect().await;
    let recovered = restarted.get_job(QUEUE, job.id).await.unwrap().unwrap();
    assert!(matches!(recovered.status, JobStatus::Delayed | JobStatus::Waiting));
    assert_eq!(recovered.attempts, 1);
    assert!(recovered.failed_reason.unwrap().contains("stalled"));
    let stats = restarted.get_stats(QUEUE).await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.pending(), 1);
    assert_eq!(broker.lease_count().await, 0);

    restarted.process(QUEUE, JOB_TYPE, 1, crashes_on_first_run()).await.unwrap();
    let done = wait_for(&restarted, job.id, JobStatus::Completed).await;
    assert_eq!(done.attempts, 2);
    assert_eq!(done.return_value, Some(json!({"attempt": 2})));

    restarted.close().await.unwrap();
    broker.cleanup().await;
}

#[tokio::test]
async fn test_stalled_job_without_attempts_left_fails() {
    let Some(broker) = Broker::from_env() else { return };
    let setup = broker.connect().await;
    let job = add(&setup, JobOptions::default().with_attempts(1)).await;
    strand(&broker, &job).await;

    let restarted = broker.connect().await;
    let failed = restarted.get_job(QUEUE, job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.failed_reason.unwrap().contains("stalled"));
    let stats = restarted.get_stats(QUEUE).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending(), 0);

    restarted.close().await.unwrap();
    broker.cleanup().await;
}

#[tokio::test]
async fn test_surviving_worker_recovers_stalled_job() {
    let Some(broker) = Broker::from_env() else { return };
    let backend = broker.connect().await;
    backend.process(QUEUE, JOB_TYPE, 2, crashes_on_first_run()).await.unwrap();
    let job = add(
        &backend,
        JobOptions::default().with_attempts(3).with_backoff(Backoff::fixed(10)),
    )
    .await;

    let done = wait_for(&backend, job.id, JobStatus::Completed).await;
    assert_eq!(done.attempts, 2);
    let stats = backend.get_stats(QUEUE).await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.completed, 1);

    backend.close().await.unwrap();
    broker.cleanup().await;
}

#[tokio::test]
async fn test_priority_limits_keep_arrival_order() {
    let Some(broker) = Broker::from_env() else { return };
    let backend = broker.connect().await;

    let mut ids = Vec::new();
    let arrivals = [
        (1, PRIORITY_LIMIT),
        (2, -PRIORITY_LIMIT),
        (3, PRIORITY_LIMIT),
        (4, -PRIORITY_LIMIT),
        (5, i32::MIN),
    ];
    for (n, priority) in arrivals {
        let job = backend
            .add_job(QUEUE, JOB_TYPE, json!({"n": n}), JobOptions::default().with_priority(priority))
            .await
            .unwrap();
        ids.push(job.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    backend
        .process(
            QUEUE,
            JOB_TYPE,
            1,
            handler_fn(move |ctx| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(ctx.job.payload["n"].as_i64().unwrap());
                    Ok(json!(null))
                }
            }),
        )
        .await
        .unwrap();
    for id in ids {
        wait_for(&backend, id, JobStatus::Completed).await;
    }
    assert_eq!(*order.lock(), vec![2, 4, 5, 1, 3]);

    backend.close().await.unwrap();
    broker.cleanup().await;
}
