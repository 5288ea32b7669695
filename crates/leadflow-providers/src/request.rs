use crate::config::{ProviderProfile, SelectionStrategy};
use base64::Engine;
use leadflow_core::Usage;
use serde::{Deserialize, Serialize};

/// Per-request options passed to the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Use this provider if it is registered and capable.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub requires_vision: bool,
    #[serde(default)]
    pub requires_structured: bool,
    #[serde(default)]
    pub speed_priority: bool,
    #[serde(default)]
    pub quality_priority: bool,
    #[serde(default)]
    pub cost_priority: bool,
    /// Overrides the orchestrator's configured strategy for this request.
    #[serde(default)]
    pub strategy: Option<SelectionStrategy>,
    /// Set to `Some(false)` to bypass the response cache.
    #[serde(default)]
    pub use_cache: Option<bool>,
}

impl RequestOptions {
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn quality(mut self) -> Self {
        self.quality_priority = true;
        self
    }

    pub fn speed(mut self) -> Self {
        self.speed_priority = true;
        self
    }

    pub fn cheap(mut self) -> Self {
        self.cost_priority = true;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = Some(false);
        self
    }
}

/// Capabilities a request needs from the provider serving it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub vision: bool,
    pub structured: bool,
}

impl Requirements {
    pub fn from_options(options: &RequestOptions) -> Self {
        Self {
            vision: options.requires_vision,
            structured: options.requires_structured,
        }
    }

    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    pub fn with_structured(mut self) -> Self {
        self.structured = true;
        self
    }
}

impl std::fmt::Display for Requirements {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.vision, self.structured) {
            (true, true) => write!(f, "vision+structured"),
            (true, false) => write!(f, "vision"),
            (false, true) => write!(f, "structured"),
            (false, false) => write!(f, "text"),
        }
    }
}

/// Concrete generation settings for one adapter call: the provider's
/// defaults overridden by whatever the request specifies.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl CallSettings {
    pub fn resolve(profile: &ProviderProfile, options: &RequestOptions) -> Self {
        Self {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| profile.model.clone()),
            temperature: options.temperature.unwrap_or(profile.temperature),
            max_tokens: options.max_tokens.unwrap_or(profile.max_tokens),
            system_prompt: options.system_prompt.clone(),
        }
    }

    /// Settings for a provider other than the one selected. A model override
    /// names a model of the selected provider, so it is not carried over.
    pub fn resolve_fallback(profile: &ProviderProfile, options: &RequestOptions) -> Self {
        Self {
            model: profile.model.clone(),
            ..Self::resolve(profile, options)
        }
    }
}

/// An image passed to `analyze_image`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    /// Inline image data, already base64 encoded.
    Base64 { media_type: String, data: String },
    /// A publicly reachable image URL.
    Url(String),
}

impl ImageInput {
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Base64 {
            media_type: media_type.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Stable identity used in cache keys.
    pub(crate) fn fingerprint(&self) -> String {
        match self {
            ImageInput::Base64 { media_type, data } => format!("{media_type}:{data}"),
            ImageInput::Url(url) => url.clone(),
        }
    }
}

/// Uniform result of every adapter call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Raw text returned by the model.
    pub content: String,
    /// Parsed JSON for structured calls.
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    /// Registered name of the provider that served the call.
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    /// Cost in USD.
    pub cost: f64,
}

impl Completion {
    /// Build a completion, computing cost from the usage.
    pub fn priced(
        content: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        usage: Usage,
        cost_per_token: f64,
    ) -> Self {
        Self {
            content: content.into(),
            structured: None,
            provider: provider.into(),
            model: model.into(),
            usage,
            cost: f64::from(usage.total_tokens) * cost_per_token,
        }
    }

    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }
}
