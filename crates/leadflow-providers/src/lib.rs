//! Multi-provider AI orchestration for Leadflow.
//!
//! [`ProviderOrchestrator`] keeps a registry of [`AiProvider`] adapters,
//! picks one per request by capability and strategy, falls back across the
//! registry on failure, caches responses and tracks per-provider health.

pub mod backends;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod request;
pub mod selection;

pub use backends::{build_provider, extract_json, AiProvider};
pub use cache::{CacheStats, ResponseCache};
pub use config::{
    ModelTier, OrchestratorConfig, ProviderConfig, ProviderKind, ProviderProfile, ScoringPolicy,
    SelectionStrategy,
};
pub use metrics::{CallMetrics, HealthStatus, MetricsRegistry, ProviderHealth};
pub use orchestrator::{ProviderDescriptor, ProviderOrchestrator};
pub use request::{CallSettings, Completion, ImageInput, RequestOptions, Requirements};
pub use selection::{classify_complexity, Complexity};
