use super::{http_client, read_body, status_error, structured_instruction, transport_error, AiProvider};
use crate::config::{ProviderConfig, ProviderProfile};
use crate::request::{CallSettings, Completion, ImageInput};
use async_trait::async_trait;
use leadflow_core::{ErrorKind, LeadflowError, LeadflowResult, Usage};
use serde::Serialize;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude (Anthropic) API backend.
pub struct ClaudeBackend {
    config: ProviderConfig,
    profile: ProviderProfile,
    api_key: String,
    http: reqwest::Client,
}

impl ClaudeBackend {
    pub fn new(config: ProviderConfig) -> LeadflowResult<Self> {
        Ok(Self {
            http: http_client(&config)?,
            profile: config.profile(),
            api_key: config.resolved_api_key(),
            config,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.config.base_url()))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
    }

    async fn send(&self, content: Vec<ClaudeContent>, call: &CallSettings) -> LeadflowResult<Completion> {
        let messages = vec![ClaudeMessage {
            role: "user",
            content,
        }];

        let mut body = serde_json::json!({
            "model": call.model,
            "max_tokens": call.max_tokens,
            "temperature": call.temperature,
            "messages": messages,
        });
        if let Some(sys) = &call.system_prompt {
            body["system"] = serde_json::json!(sys);
        }

        let resp = self
            .request(reqwest::Method::POST, "/v1/messages")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("claude", e))?;

        let (status, resp_body) = read_body("claude", resp).await?;
        if !status.is_success() {
            return Err(status_error("claude", status, &resp_body));
        }

        let (text, usage) = parse_claude_response(&resp_body)?;
        Ok(Completion::priced(
            text,
            "claude",
            &call.model,
            usage,
            self.profile.cost_per_token,
        ))
    }
}

#[async_trait]
impl AiProvider for ClaudeBackend {
    fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn supports_multimodal(&self) -> bool {
        // Every claude-3 and later model accepts images.
        self.config
            .vision
            .unwrap_or_else(|| !self.config.model_id.starts_with("claude-2"))
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn health_check(&self) -> LeadflowResult<()> {
        let resp = self
            .request(reqwest::Method::GET, "/v1/models")
            .send()
            .await
            .map_err(|e| transport_error("claude", e))?;
        let (status, body) = read_body("claude", resp).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error("claude", status, &body))
        }
    }

    async fn generate_text(&self, prompt: &str, call: &CallSettings) -> LeadflowResult<Completion> {
        self.send(vec![ClaudeContent::text(prompt)], call).await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
        call: &CallSettings,
    ) -> LeadflowResult<Completion> {
        let completion = self
            .send(
                vec![ClaudeContent::text(structured_instruction(prompt, schema))],
                call,
            )
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
                "claude",
                ErrorKind::Fatal,
                format!("Model {} does not accept images", call.model),
            ));
        }
        let source = match image {
            ImageInput::Base64 { media_type, data } => serde_json::json!({
                "type": "base64",
                "media_type": media_type,
                "data": data,
            }),
            ImageInput::Url(url) => serde_json::json!({ "type": "url", "url": url }),
        };
        self.send(
            vec![ClaudeContent::Image { source }, ClaudeContent::text(prompt)],
            call,
        )
        .await
    }
}

// -- Claude wire types --

#[derive(Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: Vec<ClaudeContent>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClaudeContent {
    Text { text: String },
    Image { source: serde_json::Value },
}

impl ClaudeContent {
    fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Extract the joined text blocks and token usage from a Messages API reply.
pub fn parse_claude_response(body: &serde_json::Value) -> LeadflowResult<(String, Usage)> {
    let content = body["content"].as_array().ok_or_else(|| {
        LeadflowError::provider("claude", ErrorKind::Fatal, "Missing content in Claude response")
    })?;

    let text = content
        .iter()
        .filter(|block| block["type"].as_str() == Some("text"))
        .filter_map(|block| block["text"].as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let usage = Usage::new(
        body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    );
    Ok((text, usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_and_usage() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": "world"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 3}
        });
        let (text, usage) = parse_claude_response(&body).unwrap();
        assert_eq!(text, "Hello\nworld");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_parse_missing_content() {
        let err = parse_claude_response(&serde_json::json!({"error": "x"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_image_content_serialization() {
        let block = ClaudeContent::Image {
            source: serde_json::json!({"type": "url", "url": "https://x/y.png"}),
        };
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "image");
        assert_eq!(v["source"]["url"], "https://x/y.png");
    }
}
