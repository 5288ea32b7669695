use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Counters for a stream of calls (one provider, one stage, or global).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// USD.
    pub total_cost: f64,
    pub total_tokens: u64,
    /// Incremental mean over every recorded request.
    pub average_response_ms: f64,
    pub cache_hits: u64,
}

impl CallMetrics {
    fn observe(&mut self, elapsed_ms: f64) {
        self.requests += 1;
        self.average_response_ms += (elapsed_ms - self.average_response_ms) / self.requests as f64;
    }

    pub fn record_success(&mut self, elapsed_ms: f64, cost: f64, tokens: u64) {
        self.observe(elapsed_ms);
        self.successes += 1;
        self.total_cost += cost;
        self.total_tokens += tokens;
    }

    pub fn record_failure(&mut self, elapsed_ms: f64) {
        self.observe(elapsed_ms);
        self.failures += 1;
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hits += 1;
    }

    /// successes / requests, 1.0 with no history.
    pub fn reliability(&self) -> f64 {
        if self.requests == 0 {
            1.0
        } else {
            self.successes as f64 / self.requests as f64
        }
    }
}

/// Health label derived from reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_reliability(reliability: f64) -> Self {
        if reliability >= 0.9 {
            HealthStatus::Healthy
        } else if reliability >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

/// Provider health as exposed in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub reliability: f64,
    pub status: HealthStatus,
}

impl From<&CallMetrics> for ProviderHealth {
    fn from(metrics: &CallMetrics) -> Self {
        let reliability = metrics.reliability();
        Self {
            reliability,
            status: HealthStatus::from_reliability(reliability),
        }
    }
}

/// Global and per-provider counters behind one lock.
#[derive(Default)]
pub struct MetricsRegistry {
    inner: Mutex<MetricsState>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsState {
    pub global: CallMetrics,
    pub providers: HashMap<String, CallMetrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider: &str, elapsed_ms: f64, cost: f64, tokens: u64) {
        let mut state = self.inner.lock();
        state.global.record_success(elapsed_ms, cost, tokens);
        state
            .providers
            .entry(provider.to_string())
            .or_default()
            .record_success(elapsed_ms, cost, tokens);
    }

    pub fn record_failure(&self, provider: &str, elapsed_ms: f64) {
        let mut state = self.inner.lock();
        state.global.record_failure(elapsed_ms);
        state
            .providers
            .entry(provider.to_string())
            .or_default()
            .record_failure(elapsed_ms);
    }

    pub fn record_cache_hit(&self, provider: &str) {
        let mut state = self.inner.lock();
        state.global.record_cache_hit();
        state
            .providers
            .entry(provider.to_string())
            .or_default()
            .record_cache_hit();
    }

    pub fn provider(&self, provider: &str) -> CallMetrics {
        self.inner
            .lock()
            .providers
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reliability(&self, provider: &str) -> f64 {
        self.inner
            .lock()
            .providers
            .get(provider)
            .map_or(1.0, CallMetrics::reliability)
    }

    pub fn snapshot(&self) -> MetricsState {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_mean() {
        let mut m = CallMetrics::default();
        m.record_success(100.0, 0.01, 10);
        m.record_success(200.0, 0.01, 10);
        m.record_failure(300.0);
        assert_eq!(m.requests, 3);
        assert!((m.average_response_ms - 200.0).abs() < 1e-9);
        assert!((m.total_cost - 0.02).abs() < 1e-12);
        assert_eq!(m.total_tokens, 20);
    }

    #[test]
    fn test_reliability_defaults_to_one() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.reliability("unknown"), 1.0);

        registry.record_success("a", 10.0, 0.0, 1);
        registry.record_failure("a", 10.0);
        assert_eq!(registry.reliability("a"), 0.5);
        assert_eq!(registry.snapshot().global.requests, 2);
    }

    #[test]
    fn test_health_thresholds() {
        assert_eq!(HealthStatus::from_reliability(1.0), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_reliability(0.7), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_reliability(0.2), HealthStatus::Unhealthy);
    }
}
