use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    OpenAi,
    OpenRouter,
    /// Groq cloud inference over the OpenAI-compatible API.
    Groq,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Claude => write!(f, "claude"),
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::OpenRouter => write!(f, "openrouter"),
            ProviderKind::Groq => write!(f, "groq"),
        }
    }
}

/// Coarse model class, used to match prompt complexity and priority bonuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Small, fast, cheap models.
    Fast,
    #[default]
    Balanced,
    /// Large models with the best output quality.
    Premium,
}

/// Configuration for a single provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Environment variable to read the API key from when `api_key` is empty.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Price in USD per token (prompt and completion averaged).
    #[serde(default = "default_cost_per_token")]
    pub cost_per_token: f64,
    #[serde(default)]
    pub tier: ModelTier,
    /// Base score this provider starts from under characteristic scoring.
    #[serde(default = "default_affinity")]
    pub affinity: f64,
    /// Overrides the model-name based vision detection.
    #[serde(default)]
    pub vision: Option<bool>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_cost_per_token() -> f64 {
    0.000_002
}

fn default_affinity() -> f64 {
    10.0
}

fn default_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            kind,
            model_id: model_id.into(),
            api_key: api_key.into(),
            api_key_env: None,
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            cost_per_token: default_cost_per_token(),
            tier: ModelTier::default(),
            affinity: default_affinity(),
            vision: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.kind {
                ProviderKind::Claude => "https://api.anthropic.com",
                ProviderKind::OpenAi => "https://api.openai.com",
                ProviderKind::OpenRouter => "https://openrouter.ai/api",
                ProviderKind::Groq => "https://api.groq.com/openai",
            }
        }
    }

    /// The API key, falling back to `api_key_env` when the inline key is empty.
    pub fn resolved_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_default()
    }

    /// Static characteristics the orchestrator scores this provider on.
    pub fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            model: self.model_id.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            cost_per_token: self.cost_per_token,
            tier: self.tier,
            affinity: self.affinity,
        }
    }
}

/// Static characteristics of a registered adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub cost_per_token: f64,
    pub tier: ModelTier,
    pub affinity: f64,
}

impl ProviderProfile {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            cost_per_token: default_cost_per_token(),
            tier: ModelTier::default(),
            affinity: default_affinity(),
        }
    }

    pub fn with_cost(mut self, cost_per_token: f64) -> Self {
        self.cost_per_token = cost_per_token;
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }
}

/// Which selection strategy the orchestrator applies when several providers qualify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    CostOptimized,
    #[default]
    Characteristic,
}

/// Weights used by characteristic scoring.
///
/// A provider's composite score is
/// `(affinity + complexity match + priority bonuses) × reliability`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringPolicy {
    /// Awarded when the provider tier matches the prompt complexity.
    #[serde(default = "default_complexity_match")]
    pub complexity_match: f64,
    /// Awarded when the tier is one step away from the prompt complexity.
    #[serde(default = "default_complexity_partial")]
    pub complexity_partial: f64,
    /// Awarded to fast-tier providers when the request asks for speed.
    #[serde(default = "default_speed_bonus")]
    pub speed_bonus: f64,
    /// Awarded to premium-tier providers when the request asks for quality.
    #[serde(default = "default_quality_bonus")]
    pub quality_bonus: f64,
    /// Awarded to the cheapest candidates when the request asks for low cost.
    #[serde(default = "default_cost_bonus")]
    pub cost_bonus: f64,
}

fn default_complexity_match() -> f64 {
    10.0
}

fn default_complexity_partial() -> f64 {
    5.0
}

fn default_speed_bonus() -> f64 {
    15.0
}

fn default_quality_bonus() -> f64 {
    15.0
}

fn default_cost_bonus() -> f64 {
    30.0
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            complexity_match: default_complexity_match(),
            complexity_partial: default_complexity_partial(),
            speed_bonus: default_speed_bonus(),
            quality_bonus: default_quality_bonus(),
            cost_bonus: default_cost_bonus(),
        }
    }
}

/// Orchestrator-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,
    #[serde(default)]
    pub scoring: ScoringPolicy,
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// The cache is pruned once it holds more entries than this.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    1000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            scoring: ScoringPolicy::default(),
            enable_fallback: true,
            enable_cache: true,
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_defaults() {
        let claude = ProviderConfig::new(ProviderKind::Claude, "claude-sonnet-4-20250514", "k");
        assert_eq!(claude.base_url(), "https://api.anthropic.com");
        let groq = ProviderConfig::new(ProviderKind::Groq, "llama-3.3-70b", "k");
        assert_eq!(groq.base_url(), "https://api.groq.com/openai");
        let custom = groq.with_base_url("http://localhost:9000");
        assert_eq!(custom.base_url(), "http://localhost:9000");
    }

    #[test]
    fn test_provider_config_from_toml_defaults() {
        let config: ProviderConfig = toml::from_str(
            r#"
            kind = "openai"
            model_id = "gpt-4o-mini"
            api_key = "sk-test"
            "#,
        )
        .unwrap();
        assert_eq!(config.kind, ProviderKind::OpenAi);
        assert_eq!(config.max_tokens, 2048);
        assert_eq!(config.tier, ModelTier::Balanced);
        assert_eq!(config.affinity, 10.0);
        assert!(config.vision.is_none());
    }

    #[test]
    fn test_api_key_env_fallback() {
        let mut config = ProviderConfig::new(ProviderKind::OpenAi, "gpt-4o", "");
        config.api_key_env = Some("LEADFLOW_TEST_KEY_THAT_IS_NOT_SET".into());
        assert_eq!(config.resolved_api_key(), "");
        config.api_key = "inline".into();
        assert_eq!(config.resolved_api_key(), "inline");
    }

    #[test]
    fn test_orchestrator_config_defaults() {
        let config: OrchestratorConfig = toml::from_str("").unwrap();
        assert_eq!(config.strategy, SelectionStrategy::Characteristic);
        assert!(config.enable_fallback);
        assert_eq!(config.cache_ttl_secs, 3600);
        assert_eq!(config.scoring.cost_bonus, 30.0);
    }
}
