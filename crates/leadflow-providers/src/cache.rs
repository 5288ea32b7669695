//! Deterministic response cache keyed by request shape.

use crate::request::{CallSettings, Completion};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Only this many leading prompt characters contribute to the cache key.
pub const PROMPT_PREFIX_CHARS: usize = 500;

/// Operation discriminator folded into cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Text,
    Structured,
    Image,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Text => "text",
            Operation::Structured => "structured",
            Operation::Image => "image",
        }
    }
}

/// Build the hex SHA-256 cache key for one request.
///
/// `extra` carries operation specific identity (the schema for structured
/// calls, the image fingerprint for vision calls).
pub fn cache_key(
    operation: Operation,
    prompt: &str,
    call: &CallSettings,
    provider: &str,
    extra: Option<&str>,
) -> String {
    let prefix: String = prompt.chars().take(PROMPT_PREFIX_CHARS).collect();
    let mut hasher = Sha256::new();
    for part in [
        operation.as_str(),
        prefix.as_str(),
        call.model.as_str(),
        &call.temperature.to_string(),
        &call.max_tokens.to_string(),
        provider,
        extra.unwrap_or(""),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Completion,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

/// Read-only view of cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// In-memory TTL cache of provider completions.
///
/// Writers race last-writer-wins. Expired entries are treated as absent and
/// dropped on read; the map is pruned once it grows past `max_entries`.
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
    stats: Mutex<CacheStats>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Completion> {
        let now = Instant::now();
        let found = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    entries.remove(key);
                    None
                }
                Some(entry) => Some(entry.value.clone()),
                None => None,
            }
        };

        let mut stats = self.stats.lock();
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    pub fn insert(&self, key: String, value: Completion) {
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl: self.ttl,
            },
        );
        if entries.len() > self.max_entries {
            Self::prune(&mut entries, self.max_entries);
        }
    }

    /// Drop expired entries, then the oldest ones until the map fits.
    fn prune(entries: &mut HashMap<String, CacheEntry>, max_entries: usize) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));

        if entries.len() > max_entries {
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.stored_at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = entries.len() - max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
        tracing::debug!(removed = before - entries.len(), "Pruned response cache");
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = *self.stats.lock();
        stats.entries = self.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::Usage;

    fn settings() -> CallSettings {
        CallSettings {
            model: "gpt-4o-mini".into(),
            temperature: 0.7,
            max_tokens: 256,
            system_prompt: None,
        }
    }

    fn completion(text: &str) -> Completion {
        Completion::priced(text, "openai", "gpt-4o-mini", Usage::new(1, 1), 0.0)
    }

    #[test]
    fn test_key_ignores_text_past_prefix() {
        let base = "x".repeat(PROMPT_PREFIX_CHARS);
        let a = cache_key(Operation::Text, &format!("{base}tail-a"), &settings(), "openai", None);
        let b = cache_key(Operation::Text, &format!("{base}tail-b"), &settings(), "openai", None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_key_depends_on_settings_and_operation() {
        let call = settings();
        let base = cache_key(Operation::Text, "hello", &call, "openai", None);

        let mut hotter = call.clone();
        hotter.temperature = 0.9;
        assert_ne!(base, cache_key(Operation::Text, "hello", &hotter, "openai", None));
        assert_ne!(base, cache_key(Operation::Structured, "hello", &call, "openai", None));
        assert_ne!(base, cache_key(Operation::Text, "hello", &call, "claude", None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(60), 10);
        cache.insert("k".into(), completion("v"));
        assert!(cache.get("k").is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_removes_oldest() {
        let cache = ResponseCache::new(Duration::from_secs(3600), 2);
        cache.insert("a".into(), completion("1"));
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert("b".into(), completion("2"));
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert("c".into(), completion("3"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }
}
