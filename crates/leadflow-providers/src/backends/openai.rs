use super::{http_client, read_body, status_error, structured_instruction, transport_error, AiProvider};
use crate::config::{ProviderConfig, ProviderKind, ProviderProfile};
use crate::request::{CallSettings, Completion, ImageInput};
use async_trait::async_trait;
use leadflow_core::{ErrorKind, LeadflowError, LeadflowResult, Usage};

/// Model name fragments of OpenAI-compatible models that accept images.
const VISION_MODELS: &[&str] = &["gpt-4o", "gpt-4-turbo", "gpt-4.1", "vision", "llava", "pixtral"];

/// OpenAI-compatible API backend.
///
/// Works with OpenAI, OpenRouter, Groq, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ProviderConfig,
    profile: ProviderProfile,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ProviderConfig) -> LeadflowResult<Self> {
        Ok(Self {
            http: http_client(&config)?,
            profile: config.profile(),
            api_key: config.resolved_api_key(),
            config,
        })
    }

    fn label(&self) -> String {
        self.config.kind.to_string()
    }

    fn build_messages(&self, call: &CallSettings, user_content: serde_json::Value) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = &call.system_prompt {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }
        api_messages.push(serde_json::json!({
            "role": "user",
            "content": user_content
        }));

        api_messages
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");

        // OpenRouter requires extra headers
        if matches!(self.config.kind, ProviderKind::OpenRouter) {
            request
                .header("HTTP-Referer", "https://leadflow.dev")
                .header("X-Title", "Leadflow")
        } else {
            request
        }
    }

    async fn send(
        &self,
        call: &CallSettings,
        user_content: serde_json::Value,
        json_mode: bool,
    ) -> LeadflowResult<Completion> {
        let label = self.label();
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let mut body = serde_json::json!({
            "model": call.model,
            "max_tokens": call.max_tokens,
            "temperature": call.temperature,
            "messages": self.build_messages(call, user_content),
        });
        if json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let resp = self
            .add_provider_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&label, e))?;

        let (status, resp_body) = read_body(&label, resp).await?;
        if !status.is_success() {
            return Err(status_error(&label, status, &resp_body));
        }

        let (text, usage) = parse_openai_response(&label, &resp_body)?;
        Ok(Completion::priced(
            text,
            label,
            &call.model,
            usage,
            self.profile.cost_per_token,
        ))
    }
}

#[async_trait]
impl AiProvider for OpenAiBackend {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn supports_multimodal(&self) -> bool {
        self.config.vision.unwrap_or_else(|| {
            let model = self.config.model_id.to_lowercase();
            VISION_MODELS.iter().any(|m| model.contains(m))
        })
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn health_check(&self) -> LeadflowResult<()> {
        let label = self.label();
        let url = format!("{}/v1/models", self.config.base_url());
        let resp = self
            .add_provider_headers(self.http.get(&url))
            .send()
            .await
            .map_err(|e| transport_error(&label, e))?;
        let (status, body) = read_body(&label, resp).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(&label, status, &body))
        }
    }

    async fn generate_text(&self, prompt: &str, call: &CallSettings) -> LeadflowResult<Completion> {
        self.send(call, serde_json::json!(prompt), false).await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        call: &CallSettings,
    ) -> LeadflowResult<Completion> {
        let completion = self
            .send(call, serde_json::json!(structured_instruction(prompt, schema)), true)
            .await?;
        let value = super::extract_json(&completion.content)?;
        Ok(completion.with_structured(value))
    }

    async fn analyze_image(
        &self,
        image: &ImageInput,
        prompt: &str,
        call: &CallSettings,
    ) -> LeadflowResult<Completion> {
        if !self.supports_multimodal() {
            return Err(LeadflowError::provider(
                self.label(),
                ErrorKind::Fatal,
                format!("Model {} does not accept images", call.model),
            ));
        }
        let url = match image {
            ImageInput::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
            ImageInput::Url(url) => url.clone(),
        };
        let content = serde_json::json!([
            { "type": "text", "text": prompt },
            { "type": "image_url", "image_url": { "url": url } }
        ]);
        self.send(call, content, false).await
    }
}

/// Extract the first choice's text and the token usage from a chat completion.
pub fn parse_openai_response(provider: &str, body: &serde_json::Value) -> LeadflowResult<(String, Usage)> {
    let message = &body["choices"][0]["message"];
    if message.is_null() {
        return Err(LeadflowError::provider(
            provider,
            ErrorKind::Fatal,
            "Missing choices in chat completion response",
        ));
    }
    let content = message["content"].as_str().unwrap_or_default().to_string();
    let usage = Usage::new(
        body["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        body["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    );
    Ok((content, usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice_and_usage() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9}
        });
        let (text, usage) = parse_openai_response("openai", &body).unwrap();
        assert_eq!(text, "Hi there");
        assert_eq!(usage.total_tokens, 9);
    }

    #[test]
    fn test_parse_missing_choices() {
        let err = parse_openai_response("groq", &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("groq"));
    }

    #[test]
    fn test_vision_detection() {
        let mini = OpenAiBackend::new(ProviderConfig::new(ProviderKind::OpenAi, "gpt-4o-mini", "k")).unwrap();
        assert!(mini.supports_multimodal());
        let mut cfg = ProviderConfig::new(ProviderKind::Groq, "llama-3.3-70b-versatile", "k");
        let groq = OpenAiBackend::new(cfg.clone()).unwrap();
        assert!(!groq.supports_multimodal());
        cfg.vision = Some(true);
        assert!(OpenAiBackend::new(cfg).unwrap().supports_multimodal());
    }
}
