//! Core types and error definitions for Leadflow.
//!
//! This crate provides the foundational types shared across all Leadflow
//! crates: the unified error enum with its retry classification, the lead and
//! campaign records the pipeline reads and updates, and token usage accounting.
//!
//! # Main types
//!
//! - [`LeadflowError`] — Unified error enum for all Leadflow subsystems.
//! - [`LeadflowResult`] — Convenience alias for `Result<T, LeadflowError>`.
//! - [`ErrorKind`] — Typed retry classification assigned at the throw site.
//! - [`Lead`] / [`Campaign`] — External records consumed by the pipeline.
//! - [`Usage`] — Token counts reported by a provider call.

/// Error enum and retry classification.
pub mod error;
/// Lead and campaign records.
pub mod lead;

pub use error::{ErrorKind, LeadflowError, LeadflowResult};
pub use lead::{Campaign, CampaignId, Lead, LeadId, ProcessingStatus};

use serde::{Deserialize, Serialize};

// --- Usage accounting ---

/// Token usage reported by a single provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Tokens produced by the completion.
    pub completion_tokens: u32,
    /// Sum of prompt and completion tokens.
    pub total_tokens: u32,
}

impl Usage {
    /// Creates usage from prompt and completion counts.
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Adds another usage record into this one.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}
