//! Per-queue policies: concurrency, attempts, backoff and retention.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// `base * 2^(attempts - 1)`.
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type", default)]
    pub kind: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    2000
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(default_base_delay_ms())
    }
}

impl Backoff {
    pub fn fixed(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay_ms,
        }
    }

    pub fn exponential(base_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms,
        }
    }

    /// Delay before the next run, given the number of runs already made.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.base_delay_ms,
            BackoffKind::Exponential => {
                let exp = attempts_made.saturating_sub(1).min(32);
                self.base_delay_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms)
    }
}

/// How many finished jobs a queue keeps for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    #[serde(default = "default_keep_completed")]
    pub keep_completed: usize,
    #[serde(default = "default_keep_failed")]
    pub keep_failed: usize,
}

fn default_keep_completed() -> usize {
    100
}

fn default_keep_failed() -> usize {
    50
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Worker count on the durable backend. The in-process backend does not cap concurrency.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_attempts")]
    pub default_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub retention: Retention,
}

fn default_concurrency() -> usize {
    1
}

fn default_attempts() -> u32 {
    3
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_attempts: default_attempts(),
            backoff: Backoff::default(),
            retention: Retention::default(),
        }
    }
}

impl QueuePolicy {
    /// Lead processing: 3 attempts, exponential from 2 s.
    pub fn ai_processing() -> Self {
        Self {
            concurrency: 5,
            default_attempts: 3,
            backoff: Backoff::exponential(2000),
            retention: Retention::default(),
        }
    }

    /// Follow-up emails.
    pub fn email_delivery() -> Self {
        Self {
            concurrency: 10,
            default_attempts: 5,
            backoff: Backoff::exponential(5000),
            retention: Retention::default(),
        }
    }

    /// Spreadsheet export.
    pub fn sheets_export() -> Self {
        Self {
            concurrency: 3,
            default_attempts: 3,
            backoff: Backoff::exponential(10_000),
            retention: Retention::default(),
        }
    }

    /// Analytics events: 2 attempts, fixed delay.
    pub fn analytics() -> Self {
        Self {
            concurrency: 5,
            default_attempts: 2,
            backoff: Backoff::fixed(5000),
            retention: Retention {
                keep_completed: 20,
                keep_failed: 20,
            },
        }
    }
}

/// Policies by queue name, with a fallback for unknown queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub default: QueuePolicy,
    #[serde(default)]
    pub queues: HashMap<String, QueuePolicy>,
}

impl Default for PolicySet {
    fn default() -> Self {
        let mut queues = HashMap::new();
        queues.insert("ai-processing".to_string(), QueuePolicy::ai_processing());
        queues.insert("email-delivery".to_string(), QueuePolicy::email_delivery());
        queues.insert("sheets-export".to_string(), QueuePolicy::sheets_export());
        queues.insert("analytics".to_string(), QueuePolicy::analytics());
        Self {
            default: QueuePolicy::default(),
            queues,
        }
    }
}

impl PolicySet {
    pub fn for_queue(&self, queue: &str) -> QueuePolicy {
        self.queues.get(queue).copied().unwrap_or(self.default)
    }

    pub fn with_policy(mut self, queue: impl Into<String>, policy: QueuePolicy) -> Self {
        self.queues.insert(queue.into(), policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let backoff = Backoff::exponential(2000);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_fixed_delays() {
        let backoff = Backoff::fixed(500);
        assert_eq!(backoff.delay_for(1), backoff.delay_for(5));
    }

    #[test]
    fn test_policy_lookup() {
        let set = PolicySet::default();
        assert_eq!(set.for_queue("ai-processing").default_attempts, 3);
        assert_eq!(set.for_queue("analytics").backoff.kind, BackoffKind::Fixed);
        assert_eq!(set.for_queue("unknown"), QueuePolicy::default());
    }

    #[test]
    fn test_policy_from_toml() {
        let set: PolicySet = toml::from_str(
            r#"
            [queues.ai-processing]
            concurrency = 2
            default_attempts = 4
            backoff = { type = "fixed", base_delay_ms = 100 }
            "#,
        )
        .unwrap();
        let policy = set.for_queue("ai-processing");
        assert_eq!(policy.concurrency, 2);
        assert_eq!(policy.backoff, Backoff::fixed(100));
        assert_eq!(policy.retention.keep_completed, 100);
    }
}
