pub mod claude;
pub mod openai;

use crate::config::{ProviderConfig, ProviderKind, ProviderProfile};
use crate::request::{CallSettings, Completion, ImageInput};
use async_trait::async_trait;
use leadflow_core::{ErrorKind, LeadflowError, LeadflowResult};
use std::sync::Arc;
use std::time::Duration;

/// Trait for AI provider adapters.
///
/// Each vendor implements this trait to handle API communication and
/// capability negotiation. The orchestrator only talks to providers through it.
///
/// To add a new vendor:
/// 1. Create a new module in `backends/`
/// 2. Implement `AiProvider` for your struct
/// 3. Add the variant to `ProviderKind` in `config.rs`
/// 4. Wire it up in [`build_provider`]
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Static characteristics used for selection and default call settings.
    fn profile(&self) -> &ProviderProfile;

    /// Whether the adapter accepts image input.
    fn supports_multimodal(&self) -> bool;

    /// Whether the adapter can be asked for JSON output.
    fn supports_structured_output(&self) -> bool;

    /// Cheap probe run at registration time.
    async fn health_check(&self) -> LeadflowResult<()>;

    async fn generate_text(&self, prompt: &str, call: &CallSettings) -> LeadflowResult<Completion>;

    /// Ask for JSON matching `schema`; `Completion::structured` holds the parsed value.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        call: &CallSettings,
    ) -> LeadflowResult<Completion>;

    async fn analyze_image(
        &self,
        image: &ImageInput,
        prompt: &str,
        call: &CallSettings,
    ) -> LeadflowResult<Completion>;
}

/// Construct the adapter for a provider configuration.
pub fn build_provider(config: ProviderConfig) -> LeadflowResult<Arc<dyn AiProvider>> {
    let provider: Arc<dyn AiProvider> = match config.kind {
        ProviderKind::Claude => Arc::new(claude::ClaudeBackend::new(config)?),
        ProviderKind::OpenAi | ProviderKind::OpenRouter | ProviderKind::Groq => {
            Arc::new(openai::OpenAiBackend::new(config)?)
        }
    };
    Ok(provider)
}

pub(crate) fn http_client(config: &ProviderConfig) -> LeadflowResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LeadflowError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Map a transport-level failure to a typed provider error.
pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> LeadflowError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() {
        ErrorKind::Overloaded
    } else if let Some(status) = err.status() {
        ErrorKind::from_status(status.as_u16())
    } else {
        ErrorKind::classify_message(&err.to_string())
    };
    LeadflowError::provider(provider, kind, err.to_string())
}

/// Map a non-success HTTP response to a typed provider error.
pub(crate) fn status_error(
    provider: &str,
    status: reqwest::StatusCode,
    body: &serde_json::Value,
) -> LeadflowError {
    LeadflowError::provider(
        provider,
        ErrorKind::from_status(status.as_u16()),
        format!("API error {status}: {body}"),
    )
}

/// Read a response body as JSON, tolerating non-JSON error pages.
pub(crate) async fn read_body(
    provider: &str,
    resp: reqwest::Response,
) -> LeadflowResult<(reqwest::StatusCode, serde_json::Value)> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| transport_error(provider, e))?;
    let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
    Ok((status, body))
}

/// Instruction appended to structured prompts.
pub(crate) fn structured_instruction(prompt: &str, schema: &serde_json::Value) -> String {
    format!(
        "{prompt}\n\nRespond with a single JSON object only, no prose, matching this JSON schema:\n{schema}"
    )
}

/// Pull the JSON object out of a model reply.
///
/// Models often wrap JSON in markdown fences or add a sentence around it, so
/// this takes the outermost `{...}` span.
pub fn extract_json(text: &str) -> LeadflowResult<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Ok(value);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if e > s => serde_json::from_str(&trimmed[s..=e])
            .map_err(|err| LeadflowError::Validation(format!("Unparseable structured response: {err}"))),
        _ => Err(LeadflowError::Validation(
            "Structured response contains no JSON object".into(),
        )),
    }
}
