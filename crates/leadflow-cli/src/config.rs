use leadflow_core::{Campaign, Lead};
use leadflow_pipeline::PipelineConfig;
use leadflow_providers::{OrchestratorConfig, ProviderConfig};
use leadflow_queue::QueueConfig;
use serde::Deserialize;
use std::path::Path;

/// Top-level `leadflow.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct LeadflowConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// One `[[providers]]` table: a registration name plus the adapter settings.
#[derive(Debug, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(flatten)]
    pub config: ProviderConfig,
}

impl LeadflowConfig {
    /// Read the config file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {e}", path.display()))?;
        Ok(toml::from_str(&raw)?)
    }

    /// `REDIS_URL` wins over the file so deployments can point at a broker
    /// without editing it.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                self.queue.redis_url = Some(url);
            }
        }
    }

    pub fn provider_configs(&self) -> impl Iterator<Item = (String, ProviderConfig)> + '_ {
        self.providers
            .iter()
            .map(|entry| (entry.name.clone(), entry.config.clone()))
    }
}

/// Input of `leadflow process`: the campaigns and leads to run.
#[derive(Debug, Deserialize)]
pub struct LeadsFile {
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    pub leads: Vec<Lead>,
}

impl LeadsFile {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read leads file '{}': {e}", path.display()))?;
        let file: Self = serde_json::from_str(&raw)?;
        for lead in &file.leads {
            if !file.campaigns.iter().any(|c| c.id == lead.campaign_id) {
                anyhow::bail!("lead {} references unknown campaign {}", lead.id, lead.campaign_id);
            }
        }
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_providers::{ModelTier, ProviderKind};

    #[test]
    fn test_full_config_parses() {
        let config: LeadflowConfig = toml::from_str(
            r#"
            [orchestrator]
            strategy = "cost_optimized"
            enable_cache = false

            [[providers]]
            name = "claude"
            kind = "claude"
            model_id = "claude-sonnet-4-20250514"
            api_key_env = "ANTHROPIC_API_KEY"
            tier = "premium"

            [[providers]]
            name = "groq"
            kind = "groq"
            model_id = "llama-3.3-70b-versatile"
            api_key = "gsk-test"
            tier = "fast"
            cost_per_token = 0.0000005

            [pipeline]
            quality_threshold = 0.7
            retry_delay_secs = 10

            [queue]
            redis_url = "redis://localhost:6379"
            key_prefix = "staging"
            "#,
        )
        .unwrap();

        assert!(!config.orchestrator.enable_cache);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name, "claude");
        assert_eq!(config.providers[0].config.kind, ProviderKind::Claude);
        assert_eq!(config.providers[0].config.tier, ModelTier::Premium);
        assert_eq!(config.providers[1].config.kind, ProviderKind::Groq);
        assert_eq!(config.pipeline.quality_threshold, 0.7);
        assert_eq!(config.pipeline.retry_delay_secs, Some(10));
        assert_eq!(config.queue.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.queue.key_prefix, "staging");

        let names: Vec<String> = config.provider_configs().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["claude", "groq"]);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: LeadflowConfig = toml::from_str("").unwrap();
        assert!(config.providers.is_empty());
        assert!(config.queue.redis_url.is_none());
        assert_eq!(config.pipeline.quality_threshold, 0.6);
        assert!(config.orchestrator.enable_fallback);
    }

    #[tokio::test]
    async fn test_missing_config_file_yields_defaults() {
        let config = LeadflowConfig::load(Path::new("/nonexistent/leadflow.toml"))
            .await
            .unwrap();
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_leads_file_parses() {
        let file: LeadsFile = serde_json::from_str(
            r#"{
                "campaigns": [{"id": 1, "name": "Skin quiz", "google_sheet_id": "sheet-1"}],
                "leads": [{"id": 7, "campaign_id": 1, "name": "Ana", "answers": {"q1": "dry"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(file.campaigns[0].campaign_type, "quiz");
        assert_eq!(file.leads[0].answers["q1"], "dry");
        assert_eq!(file.leads[0].retry_count, 0);
    }
}
