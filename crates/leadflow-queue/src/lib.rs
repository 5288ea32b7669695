//! Retryable job queues for Leadflow.
//!
//! [`QueueManager`] probes a Redis broker at startup. When it answers, every
//! queue is durable; otherwise every queue runs in process with the same
//! contract. Jobs move `waiting → active → completed | delayed | failed`,
//! retried under the per-queue [`QueuePolicy`].
//!
//! # Main types
//!
//! - [`QueueBackend`] — Store plus dispatcher, implemented by each backend.
//! - [`JobHandler`] — Async work for one job type.
//! - [`Job`] / [`JobStatus`] — Queue-owned unit of work.
//! - [`JobFailure`] — Handler error with a [`RetryDirective`].

/// Backend trait and guarantee reporting.
pub mod backend;
/// Redis-backed durable queues.
#[cfg(feature = "redis")]
pub mod durable;
/// In-process queue emulation.
pub mod ephemeral;
/// Handler trait, failures and progress.
pub mod handler;
/// Job records and counts.
pub mod job;
/// Retry settlement shared by backends.
pub mod lifecycle;
/// Startup selection and handler registry.
pub mod manager;
/// Per-queue policies.
pub mod policy;

pub use backend::{BackendKind, Guarantees, QueueBackend};
#[cfg(feature = "redis")]
pub use durable::{RedisBackend, RedisSettings};
pub use ephemeral::EphemeralBackend;
pub use handler::{handler_fn, JobContext, JobFailure, JobHandler, ProgressHandle, RetryDirective};
pub use job::{Job, JobId, JobOptions, JobStatus, QueueStats, PRIORITY_LIMIT};
pub use lifecycle::{apply_failure, settle_failure, Settlement};
pub use manager::{Dispatch, QueueConfig, QueueManager};
pub use policy::{Backoff, BackoffKind, PolicySet, QueuePolicy, Retention};
