use crate::backends::{build_provider, AiProvider};
use crate::cache::{cache_key, CacheStats, Operation, ResponseCache};
use crate::config::{ModelTier, OrchestratorConfig, ProviderConfig, SelectionStrategy};
use crate::metrics::{CallMetrics, MetricsRegistry, ProviderHealth};
use crate::request::{CallSettings, Completion, ImageInput, RequestOptions, Requirements};
use crate::selection::{self, Candidate};
use leadflow_core::{LeadflowError, LeadflowResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct RegisteredProvider {
    name: String,
    adapter: Arc<dyn AiProvider>,
}

impl RegisteredProvider {
    fn satisfies(&self, requirements: Requirements) -> bool {
        (!requirements.vision || self.adapter.supports_multimodal())
            && (!requirements.structured || self.adapter.supports_structured_output())
    }
}

/// Read-only snapshot of one registered provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub model: String,
    pub vision: bool,
    pub structured_output: bool,
    pub cost_per_token: f64,
    pub max_tokens: u32,
    pub tier: ModelTier,
    pub health: ProviderHealth,
    pub metrics: CallMetrics,
}

/// Routes AI requests across the registered provider adapters.
///
/// Owns the provider registry (in registration order), the response cache
/// and the call metrics. Construct one per process and share it as an `Arc`.
pub struct ProviderOrchestrator {
    config: OrchestratorConfig,
    providers: RwLock<Vec<RegisteredProvider>>,
    metrics: MetricsRegistry,
    cache: ResponseCache,
    round_robin: AtomicUsize,
}

impl ProviderOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let cache = ResponseCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
        );
        Self {
            config,
            providers: RwLock::new(Vec::new()),
            metrics: MetricsRegistry::new(),
            cache,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Build the orchestrator and register every configured provider.
    pub async fn from_config(
        config: OrchestratorConfig,
        providers: impl IntoIterator<Item = (String, ProviderConfig)>,
    ) -> Self {
        let orchestrator = Self::new(config);
        for (name, provider) in providers {
            orchestrator.register_provider(&name, provider).await;
        }
        orchestrator
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Construct and health-probe an adapter. Returns whether it was registered.
    pub async fn register_provider(&self, name: &str, config: ProviderConfig) -> bool {
        match build_provider(config) {
            Ok(adapter) => self.register_adapter(name, adapter).await,
            Err(e) => {
                warn!(provider = name, error = %e, "Failed to construct provider, skipping");
                false
            }
        }
    }

    /// Health-probe a pre-built adapter and add it to the registry.
    ///
    /// Re-registering a name replaces the adapter but keeps its position.
    pub async fn register_adapter(&self, name: &str, adapter: Arc<dyn AiProvider>) -> bool {
        if let Err(e) = adapter.health_check().await {
            warn!(provider = name, error = %e, "Provider failed health check, not registered");
            return false;
        }

        let mut providers = self.providers.write();
        if let Some(existing) = providers.iter_mut().find(|p| p.name == name) {
            existing.adapter = adapter;
        } else {
            providers.push(RegisteredProvider {
                name: name.to_string(),
                adapter,
            });
        }
        info!(
            provider = name,
            total = providers.len(),
            "Registered AI provider"
        );
        true
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.read().iter().map(|p| p.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    fn adapter(&self, name: &str) -> Option<Arc<dyn AiProvider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.name == name)
            .map(|p| Arc::clone(&p.adapter))
    }

    /// Choose the provider for a request.
    pub fn select_provider(&self, prompt: &str, options: &RequestOptions) -> LeadflowResult<String> {
        self.select(prompt, options, Requirements::from_options(options))
    }

    fn select(
        &self,
        prompt: &str,
        options: &RequestOptions,
        requirements: Requirements,
    ) -> LeadflowResult<String> {
        let providers = self.providers.read();

        if let Some(requested) = &options.provider {
            match providers.iter().find(|p| &p.name == requested) {
                Some(p) if p.satisfies(requirements) => return Ok(p.name.clone()),
                Some(_) => warn!(
                    provider = %requested,
                    %requirements,
                    "Requested provider lacks required capabilities, ignoring"
                ),
                None => warn!(provider = %requested, "Requested provider is not registered, ignoring"),
            }
        }

        let eligible: Vec<&RegisteredProvider> =
            providers.iter().filter(|p| p.satisfies(requirements)).collect();

        match eligible.as_slice() {
            [] => {
                return Err(LeadflowError::NoSuitableProvider(format!(
                    "no registered provider supports {requirements} requests"
                )))
            }
            [only] => return Ok(only.name.clone()),
            _ => {}
        }

        let candidates: Vec<Candidate<'_>> = eligible
            .iter()
            .map(|p| Candidate {
                name: &p.name,
                profile: p.adapter.profile(),
                reliability: self.metrics.reliability(&p.name),
            })
            .collect();

        let strategy = options.strategy.unwrap_or(self.config.strategy);
        let chosen = match strategy {
            SelectionStrategy::RoundRobin => {
                let counter = self.round_robin.fetch_add(1, Ordering::Relaxed);
                selection::round_robin(&candidates, counter)
            }
            SelectionStrategy::CostOptimized => selection::cheapest(&candidates, prompt, options),
            SelectionStrategy::Characteristic => {
                selection::best_by_characteristics(&candidates, prompt, options, &self.config.scoring)
            }
        };

        let chosen = chosen
            .map(str::to_string)
            .ok_or_else(|| LeadflowError::NoSuitableProvider(requirements.to_string()))?;
        debug!(provider = %chosen, ?strategy, "Selected provider");
        Ok(chosen)
    }

    /// Run `operation` against `primary`, then each other capable provider
    /// in registration order until one succeeds.
    ///
    /// Each attempt gets its call settings resolved against that provider's
    /// profile; `options.model` only applies to `primary`.
    pub async fn execute_with_fallback<F, Fut>(
        &self,
        primary: &str,
        requirements: Requirements,
        options: &RequestOptions,
        operation: F,
    ) -> LeadflowResult<Completion>
    where
        F: Fn(Arc<dyn AiProvider>, CallSettings) -> Fut,
        Fut: Future<Output = LeadflowResult<Completion>>,
    {
        let chain: Vec<(String, Arc<dyn AiProvider>)> = {
            let providers = self.providers.read();
            let head = providers.iter().filter(|p| p.name == primary);
            let rest = providers
                .iter()
                .filter(|p| p.name != primary && p.satisfies(requirements));
            let chain = head.chain(rest).map(|p| (p.name.clone(), Arc::clone(&p.adapter)));
            if self.config.enable_fallback {
                chain.collect()
            } else {
                chain.take(1).collect()
            }
        };

        if chain.is_empty() {
            return Err(LeadflowError::NoSuitableProvider(format!(
                "provider {primary} is not registered"
            )));
        }

        let mut attempts = 0usize;
        let mut last_error: Option<LeadflowError> = None;

        for (index, (name, adapter)) in chain.into_iter().enumerate() {
            attempts += 1;
            let call = if name == primary {
                CallSettings::resolve(adapter.profile(), options)
            } else {
                CallSettings::resolve_fallback(adapter.profile(), options)
            };
            let started = Instant::now();
            match operation(adapter, call).await {
                Ok(mut completion) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.record_success(
                        &name,
                        elapsed_ms,
                        completion.cost,
                        u64::from(completion.usage.total_tokens),
                    );
                    if index > 0 {
                        warn!(
                            primary,
                            provider = %name,
                            attempts,
                            "Served by fallback provider"
                        );
                    }
                    completion.provider = name;
                    return Ok(completion);
                }
                Err(e) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.metrics.record_failure(&name, elapsed_ms);
                    warn!(
                        provider = %name,
                        kind = %e.kind(),
                        error = %e,
                        "Provider call failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            LeadflowError::NoSuitableProvider(format!("provider {primary} produced no attempt"))
        });
        if !self.config.enable_fallback {
            return Err(last);
        }
        Err(LeadflowError::AllProvidersFailed {
            attempts,
            last: Box::new(last),
        })
    }

    fn cache_enabled(&self, options: &RequestOptions) -> bool {
        self.config.enable_cache && options.use_cache.unwrap_or(true)
    }

    /// Resolve the cache key against the selected provider's defaults.
    fn key_for(
        &self,
        operation: Operation,
        provider: &str,
        prompt: &str,
        options: &RequestOptions,
        extra: Option<&str>,
    ) -> Option<String> {
        let adapter = self.adapter(provider)?;
        let call = CallSettings::resolve(adapter.profile(), options);
        Some(cache_key(operation, prompt, &call, provider, extra))
    }

    fn cached(&self, key: Option<&str>, provider: &str) -> Option<Completion> {
        let hit = self.cache.get(key?)?;
        self.metrics.record_cache_hit(provider);
        debug!(provider, "Response cache hit");
        Some(hit)
    }

    fn store(&self, key: Option<String>, completion: &Completion) {
        if let Some(key) = key {
            self.cache.insert(key, completion.clone());
        }
    }

    pub async fn generate_text(&self, prompt: &str, options: &RequestOptions) -> LeadflowResult<Completion> {
        let requirements = Requirements::from_options(options);
        let primary = self.select(prompt, options, requirements)?;

        let key = if self.cache_enabled(options) {
            self.key_for(Operation::Text, &primary, prompt, options, None)
        } else {
            None
        };
        if let Some(hit) = self.cached(key.as_deref(), &primary) {
            return Ok(hit);
        }

        let completion = self
            .execute_with_fallback(&primary, requirements, options, |adapter, call| async move {
                adapter.generate_text(prompt, &call).await
            })
            .await?;
        self.store(key, &completion);
        Ok(completion)
    }

    /// Generate JSON matching `schema`; the parsed value is in `Completion::structured`.
    pub async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        options: &RequestOptions,
    ) -> LeadflowResult<Completion> {
        let requirements = Requirements::from_options(options).with_structured();
        let primary = self.select(prompt, options, requirements)?;

        let key = if self.cache_enabled(options) {
            let schema_text = schema.to_string();
            self.key_for(Operation::Structured, &primary, prompt, options, Some(&schema_text))
        } else {
            None
        };
        if let Some(hit) = self.cached(key.as_deref(), &primary) {
            return Ok(hit);
        }

        let completion = self
            .execute_with_fallback(&primary, requirements, options, |adapter, call| async move {
                adapter.generate_structured(prompt, schema, &call).await
            })
            .await?;
        self.store(key, &completion);
        Ok(completion)
    }

    pub async fn analyze_image(
        &self,
        image: &ImageInput,
        prompt: &str,
        options: &RequestOptions,
    ) -> LeadflowResult<Completion> {
        let requirements = Requirements::from_options(options).with_vision();
        let primary = self.select(prompt, options, requirements)?;

        let key = if self.cache_enabled(options) {
            let fingerprint = image.fingerprint();
            self.key_for(Operation::Image, &primary, prompt, options, Some(&fingerprint))
        } else {
            None
        };
        if let Some(hit) = self.cached(key.as_deref(), &primary) {
            return Ok(hit);
        }

        let completion = self
            .execute_with_fallback(&primary, requirements, options, |adapter, call| async move {
                adapter.analyze_image(image, prompt, &call).await
            })
            .await?;
        self.store(key, &completion);
        Ok(completion)
    }

    /// Re-probe every registered provider. Results are in registration order.
    pub async fn health_check_all(&self) -> Vec<(String, bool)> {
        let adapters: Vec<(String, Arc<dyn AiProvider>)> = self
            .providers
            .read()
            .iter()
            .map(|p| (p.name.clone(), Arc::clone(&p.adapter)))
            .collect();

        let mut results = Vec::with_capacity(adapters.len());
        for (name, adapter) in adapters {
            let healthy = match adapter.health_check().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(provider = %name, error = %e, "Health check failed");
                    false
                }
            };
            results.push((name, healthy));
        }
        results
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .read()
            .iter()
            .map(|p| {
                let metrics = self.metrics.provider(&p.name);
                let profile = p.adapter.profile();
                ProviderDescriptor {
                    name: p.name.clone(),
                    model: profile.model.clone(),
                    vision: p.adapter.supports_multimodal(),
                    structured_output: p.adapter.supports_structured_output(),
                    cost_per_token: profile.cost_per_token,
                    max_tokens: profile.max_tokens,
                    tier: profile.tier,
                    health: ProviderHealth::from(&metrics),
                    metrics,
                }
            })
            .collect()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Serialize providers, counters and cache state.
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::json!({
            "strategy": self.config.strategy,
            "fallback_enabled": self.config.enable_fallback,
            "providers": self.descriptors(),
            "global": self.metrics.snapshot().global,
            "cache": self.cache.stats(),
        })
    }
}

impl Default for ProviderOrchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}
