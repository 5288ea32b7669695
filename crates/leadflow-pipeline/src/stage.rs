use leadflow_core::Usage;
use serde::{Deserialize, Serialize};

/// Ordered stages a lead passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Loads the lead and campaign and marks the lead as processing.
    Initialization,
    /// Structured profile of the lead's answers.
    Analysis,
    /// Personalized result text shown to the lead.
    ResponseGeneration,
    /// Follow-up email. Falls back to a fixed template on failure.
    EmailGeneration,
    /// Weighted quality score over the generated outputs.
    Validation,
    /// Persists the result and enqueues follow-up jobs.
    Finalization,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Initialization,
        Stage::Analysis,
        Stage::ResponseGeneration,
        Stage::EmailGeneration,
        Stage::Validation,
        Stage::Finalization,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Initialization => "initialization",
            Stage::Analysis => "analysis",
            Stage::ResponseGeneration => "response_generation",
            Stage::EmailGeneration => "email_generation",
            Stage::Validation => "validation",
            Stage::Finalization => "finalization",
        }
    }

    /// 1-based position in the pipeline.
    pub fn position(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }

    /// Whether a failure aborts the rest of the pipeline.
    ///
    /// A failed finalization means the result was never persisted.
    pub fn is_critical(self) -> bool {
        !matches!(self, Stage::EmailGeneration | Stage::Validation)
    }

    /// Progress percentage reported when this stage starts.
    pub fn progress(self) -> u8 {
        (self.position() * 100 / Self::ALL.len()) as u8
    }

    /// Stages that call a provider.
    pub fn uses_provider(self) -> bool {
        matches!(
            self,
            Stage::Analysis | Stage::ResponseGeneration | Stage::EmailGeneration
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResult {
    pub result: serde_json::Value,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub cost: f64,
    pub processing_time_ms: u64,
    /// The stage failed and `result` is a substitute.
    #[serde(default)]
    pub fallback: bool,
}

impl StageResult {
    /// Result computed locally, without a provider call.
    pub fn local(result: serde_json::Value, processing_time_ms: u64) -> Self {
        Self {
            result,
            processing_time_ms,
            ..Self::default()
        }
    }
}
