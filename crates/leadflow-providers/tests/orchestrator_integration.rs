#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use leadflow_core::{ErrorKind, LeadflowError, LeadflowResult, Usage};
use leadflow_providers::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A mock adapter that returns a scripted sequence of results, then succeeds.
struct MockProvider {
    profile: ProviderProfile,
    vision: bool,
    structured: bool,
    healthy: bool,
    results: tokio::sync::Mutex<Vec<LeadflowResult<String>>>,
    call_count: AtomicU32,
}

impl MockProvider {
    fn new(model: &str) -> Self {
        Self {
            profile: ProviderProfile::new(model),
            vision: false,
            structured: true,
            healthy: true,
            results: tokio::sync::Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
        }
    }

    fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    fn without_structured(mut self) -> Self {
        self.structured = false;
        self
    }

    fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    fn with_cost(mut self, cost: f64) -> Self {
        self.profile = self.profile.with_cost(cost);
        self
    }

    fn failing(mut self, n: usize) -> Self {
        let errors = (0..n)
            .map(|_| {
                Err(LeadflowError::provider(
                    "mock",
                    ErrorKind::Overloaded,
                    "503 Service Unavailable",
                ))
            })
            .collect();
        self.results = tokio::sync::Mutex::new(errors);
        self
    }

    fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn next(&self, call: &CallSettings) -> LeadflowResult<Completion> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().await;
        let text = if results.is_empty() {
            format!("reply from {}", self.profile.model)
        } else {
            results.remove(0)?
        };
        Ok(Completion::priced(
            text,
            "mock",
            &call.model,
            Usage::new(10, 5),
            self.profile.cost_per_token,
        ))
    }
}

#[async_trait]
impl AiProvider for MockProvider {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn supports_multimodal(&self) -> bool {
        self.vision
    }

    fn supports_structured_output(&self) -> bool {
        self.structured
    }

    async fn health_check(&self) -> LeadflowResult<()> {
        if self.healthy {
            Ok(())
        } else {
            Err(LeadflowError::provider("mock", ErrorKind::Fatal, "401 invalid key"))
        }
    }

    async fn generate_text(&self, _prompt: &str, call: &CallSettings) -> LeadflowResult<Completion> {
        self.next(call).await
    }

    async fn generate_structured(
        &self,
        _prompt: &str,
        _schema: &serde_json::Value,
        call: &CallSettings,
    ) -> LeadflowResult<Completion> {
        let completion = self.next(call).await?;
        Ok(completion.with_structured(serde_json::json!({"summary": "ok", "score": 0.9})))
    }

    async fn analyze_image(
        &self,
        _image: &ImageInput,
        _prompt: &str,
        call: &CallSettings,
    ) -> LeadflowResult<Completion> {
        self.next(call).await
    }
}

async fn orchestrator_with(
    config: OrchestratorConfig,
    providers: Vec<(&str, Arc<MockProvider>)>,
) -> ProviderOrchestrator {
    let orchestrator = ProviderOrchestrator::new(config);
    for (name, provider) in providers {
        assert!(orchestrator.register_adapter(name, provider).await);
    }
    orchestrator
}

// ---------------------------------------------------------------------------
// 1. Registration: failed health check excludes the provider
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unhealthy_provider_is_not_registered() {
    let orchestrator = ProviderOrchestrator::default();
    assert!(
        !orchestrator
            .register_adapter("broken", Arc::new(MockProvider::new("m").unhealthy()))
            .await
    );
    assert!(
        orchestrator
            .register_adapter("ok", Arc::new(MockProvider::new("m")))
            .await
    );
    assert_eq!(orchestrator.provider_names(), vec!["ok".to_string()]);
}

// ---------------------------------------------------------------------------
// 2. Capability filter never returns a provider lacking a capability
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capability_filter_respects_requirements() {
    let text_only = Arc::new(MockProvider::new("text").without_structured());
    let vision = Arc::new(MockProvider::new("vision").with_vision());
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![("text", text_only), ("vision", vision)],
    )
    .await;

    let vision_opts = RequestOptions {
        requires_vision: true,
        ..Default::default()
    };
    for _ in 0..5 {
        assert_eq!(orchestrator.select_provider("describe", &vision_opts).unwrap(), "vision");
    }

    // An explicit provider that lacks the capability is ignored.
    let explicit = vision_opts.clone().with_provider("text");
    assert_eq!(orchestrator.select_provider("describe", &explicit).unwrap(), "vision");

    let structured = RequestOptions {
        requires_structured: true,
        ..Default::default()
    };
    assert_eq!(orchestrator.select_provider("json", &structured).unwrap(), "vision");
}

#[tokio::test]
async fn empty_candidate_set_is_an_error() {
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![("text", Arc::new(MockProvider::new("text")))],
    )
    .await;

    let err = orchestrator
        .analyze_image(&ImageInput::Url("https://x/y.png".into()), "what is this", &RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LeadflowError::NoSuitableProvider(_)));
}

#[tokio::test]
async fn explicit_provider_is_honored() {
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![
            ("a", Arc::new(MockProvider::new("a"))),
            ("b", Arc::new(MockProvider::new("b"))),
        ],
    )
    .await;
    let options = RequestOptions::default().with_provider("b");
    assert_eq!(orchestrator.select_provider("hi", &options).unwrap(), "b");

    let unknown = RequestOptions::default().with_provider("nope");
    assert_eq!(orchestrator.select_provider("hi", &unknown).unwrap(), "a");
}

// ---------------------------------------------------------------------------
// 3. Fallback: k providers, first k-1 fail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fallback_reaches_last_provider_after_k_attempts() {
    let p1 = Arc::new(MockProvider::new("p1").failing(1));
    let p2 = Arc::new(MockProvider::new("p2").failing(1));
    let p3 = Arc::new(MockProvider::new("p3"));
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![("p1", p1.clone()), ("p2", p2.clone()), ("p3", p3.clone())],
    )
    .await;

    let options = RequestOptions::default().with_provider("p1").without_cache();
    let completion = orchestrator.generate_text("hello", &options).await.unwrap();

    assert_eq!(completion.provider, "p3");
    assert_eq!(completion.content, "reply from p3");
    assert_eq!(p1.calls() + p2.calls() + p3.calls(), 3);

    let p1_metrics = orchestrator.metrics().provider("p1");
    assert_eq!(p1_metrics.failures, 1);
    assert_eq!(orchestrator.metrics().provider("p3").successes, 1);
    assert_eq!(orchestrator.metrics().snapshot().global.requests, 3);
}

#[tokio::test]
async fn all_providers_failing_wraps_last_error() {
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![
            ("p1", Arc::new(MockProvider::new("p1").failing(1))),
            ("p2", Arc::new(MockProvider::new("p2").failing(1))),
        ],
    )
    .await;

    let err = orchestrator
        .generate_text("hello", &RequestOptions::default().with_provider("p1"))
        .await
        .unwrap_err();
    match &err {
        LeadflowError::AllProvidersFailed { attempts, last } => {
            assert_eq!(*attempts, 2);
            assert!(last.to_string().contains("503"));
        }
        other => panic!("Expected AllProvidersFailed, got {other:?}"),
    }
    assert!(err.is_retryable());
}

#[tokio::test]
async fn fallback_disabled_stops_after_first_failure() {
    let p1 = Arc::new(MockProvider::new("p1").failing(1));
    let p2 = Arc::new(MockProvider::new("p2"));
    let config = OrchestratorConfig {
        enable_fallback: false,
        ..Default::default()
    };
    let orchestrator = orchestrator_with(config, vec![("p1", p1.clone()), ("p2", p2.clone())]).await;

    let err = orchestrator
        .generate_text("hello", &RequestOptions::default().with_provider("p1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LeadflowError::Provider { kind: ErrorKind::Overloaded, .. }));
    assert_eq!(p1.calls(), 1);
    assert_eq!(p2.calls(), 0);
}

#[tokio::test]
async fn pinned_model_is_not_sent_to_fallback_provider() {
    let openai = Arc::new(MockProvider::new("gpt-4o-mini").failing(1));
    let claude = Arc::new(MockProvider::new("claude-sonnet-4-20250514"));
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![("openai", openai.clone()), ("claude", claude.clone())],
    )
    .await;

    let mut options = RequestOptions::default().with_provider("openai").without_cache();
    options.model = Some("gpt-4o-2024-08-06".into());

    let completion = orchestrator.generate_text("hello", &options).await.unwrap();
    assert_eq!(completion.provider, "claude");
    assert_eq!(completion.model, "claude-sonnet-4-20250514");
    assert_eq!(openai.calls(), 1);

    // The selected provider still gets the pinned model.
    let completion = orchestrator.generate_text("hello again", &options).await.unwrap();
    assert_eq!(completion.provider, "openai");
    assert_eq!(completion.model, "gpt-4o-2024-08-06");
}

// ---------------------------------------------------------------------------
// 4. Cache: identical requests within TTL hit the provider once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn identical_requests_within_ttl_call_once() {
    let provider = Arc::new(MockProvider::new("m"));
    let config = OrchestratorConfig {
        cache_ttl_secs: 60,
        ..Default::default()
    };
    let orchestrator = orchestrator_with(config, vec![("only", provider.clone())]).await;
    let options = RequestOptions::default();

    let first = orchestrator.generate_text("same prompt", &options).await.unwrap();
    let second = orchestrator.generate_text("same prompt", &options).await.unwrap();
    assert_eq!(first.content, second.content);
    assert_eq!(provider.calls(), 1);
    assert_eq!(orchestrator.cache_stats().hits, 1);
    assert_eq!(orchestrator.metrics().provider("only").cache_hits, 1);

    tokio::time::advance(std::time::Duration::from_secs(61)).await;
    orchestrator.generate_text("same prompt", &options).await.unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn cache_bypass_and_distinct_operations() {
    let provider = Arc::new(MockProvider::new("m"));
    let orchestrator = orchestrator_with(OrchestratorConfig::default(), vec![("only", provider.clone())]).await;

    let no_cache = RequestOptions::default().without_cache();
    orchestrator.generate_text("p", &no_cache).await.unwrap();
    orchestrator.generate_text("p", &no_cache).await.unwrap();
    assert_eq!(provider.calls(), 2);

    let schema = serde_json::json!({"type": "object"});
    let structured = orchestrator
        .generate_structured("p", &schema, &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(structured.structured.unwrap()["score"], 0.9);
    assert_eq!(provider.calls(), 3);
}

// ---------------------------------------------------------------------------
// 5. Strategies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cost_priority_prefers_cheaper_unreliable_provider() {
    let a = Arc::new(MockProvider::new("a").with_cost(0.01));
    let b = Arc::new(MockProvider::new("b").with_cost(0.02));
    let orchestrator = orchestrator_with(OrchestratorConfig::default(), vec![("A", a), ("B", b)]).await;

    // A: 1 success, 1 failure -> reliability 0.5. B: no history -> 1.0.
    orchestrator.metrics().record_success("A", 10.0, 0.0, 1);
    orchestrator.metrics().record_failure("A", 10.0);

    let prompt = "Write a follow-up email";
    let cheap = RequestOptions::default().cheap();
    assert_eq!(orchestrator.select_provider(prompt, &cheap).unwrap(), "A");

    let quality = RequestOptions::default().quality();
    assert_eq!(orchestrator.select_provider(prompt, &quality).unwrap(), "B");
}

#[tokio::test]
async fn round_robin_and_cost_strategies() {
    let orchestrator = orchestrator_with(
        OrchestratorConfig {
            strategy: SelectionStrategy::RoundRobin,
            ..Default::default()
        },
        vec![
            ("a", Arc::new(MockProvider::new("a").with_cost(0.03))),
            ("b", Arc::new(MockProvider::new("b").with_cost(0.01))),
        ],
    )
    .await;

    let options = RequestOptions::default();
    let picks: Vec<String> = (0..4)
        .map(|_| orchestrator.select_provider("x", &options).unwrap())
        .collect();
    assert_eq!(picks, vec!["a", "b", "a", "b"]);

    let cost = RequestOptions {
        strategy: Some(SelectionStrategy::CostOptimized),
        ..Default::default()
    };
    assert_eq!(orchestrator.select_provider("x", &cost).unwrap(), "b");
}

// ---------------------------------------------------------------------------
// 6. Snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn descriptors_and_status_json() {
    let orchestrator = orchestrator_with(
        OrchestratorConfig::default(),
        vec![("main", Arc::new(MockProvider::new("m").with_vision().failing(1)))],
    )
    .await;
    let _ = orchestrator
        .generate_text("x", &RequestOptions::default())
        .await;

    let descriptors = orchestrator.descriptors();
    assert_eq!(descriptors.len(), 1);
    assert!(descriptors[0].vision);
    assert_eq!(descriptors[0].health.reliability, 0.0);
    assert_eq!(descriptors[0].health.status, HealthStatus::Unhealthy);

    let status = orchestrator.status_json();
    assert_eq!(status["providers"][0]["name"], "main");
    assert_eq!(status["global"]["failures"], 1);

    let health = orchestrator.health_check_all().await;
    assert_eq!(health, vec![("main".to_string(), true)]);
}
