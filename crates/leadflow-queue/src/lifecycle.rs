//! State transitions shared by every backend.

use crate::handler::{JobFailure, RetryDirective};
use crate::job::Job;
use std::time::Duration;

/// Outcome of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Park the job and run it again after the delay.
    Retry(Duration),
    /// Terminal failure.
    Failed,
}

/// Decide what happens to `job` after `failure`.
///
/// `job.attempts` already counts the run that just failed, so a job with
/// `max_attempts = 3` fails on its third failed run.
pub fn settle_failure(job: &Job, failure: &JobFailure) -> Settlement {
    if job.attempts >= job.max_attempts {
        return Settlement::Failed;
    }
    match failure.directive {
        RetryDirective::Never => Settlement::Failed,
        RetryDirective::After(delay) => Settlement::Retry(delay),
        RetryDirective::Backoff => Settlement::Retry(job.backoff.delay_for(job.attempts)),
    }
}

/// Apply a failed run to `job` and return the settlement.
pub fn apply_failure(job: &mut Job, failure: &JobFailure) -> Settlement {
    let settlement = settle_failure(job, failure);
    job.failed_reason = Some(failure.error.clone());
    match settlement {
        Settlement::Retry(delay) => job.mark_delayed(delay),
        Settlement::Failed => job.mark_failed(failure.error.clone()),
    }
    settlement
}

/// Trim the oldest finished ids so at most `keep` remain. Returns the removed ids.
pub(crate) fn overflow<T: Clone>(finished: &mut std::collections::VecDeque<T>, keep: usize) -> Vec<T> {
    let mut removed = Vec::new();
    while finished.len() > keep {
        if let Some(id) = finished.pop_front() {
            removed.push(id);
        }
    }
    removed
}
