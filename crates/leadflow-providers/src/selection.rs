//! Provider selection strategies.
//!
//! Selection runs over a list of [`Candidate`]s that already satisfy the
//! request's capability requirements, in registration order.

use crate::config::{ModelTier, ProviderProfile, ScoringPolicy};
use crate::request::RequestOptions;
use serde::Serialize;

const HIGH_KEYWORDS: &[&str] = &[
    "analyze",
    "analyse",
    "analysis",
    "comprehensive",
    "detailed",
    "strategy",
    "strategic",
    "evaluate",
    "evaluation",
    "compare",
    "comparison",
    "in-depth",
    "personalized",
    "personalised",
    "reasoning",
    "insights",
];

const LOW_KEYWORDS: &[&str] = &[
    "simple", "brief", "short", "summarize", "summarise", "list", "classify", "extract",
];

/// Prompts longer than this are treated as high complexity regardless of wording.
const HIGH_LENGTH: usize = 4000;
/// Prompts must be shorter than this to be classified low complexity.
const LOW_LENGTH: usize = 1000;

/// Heuristic complexity class of a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// The tier whose models are meant for this complexity.
    pub fn preferred_tier(self) -> ModelTier {
        match self {
            Complexity::Low => ModelTier::Fast,
            Complexity::Medium => ModelTier::Balanced,
            Complexity::High => ModelTier::Premium,
        }
    }
}

/// Classify a prompt by keyword hits and length.
pub fn classify_complexity(prompt: &str) -> Complexity {
    let lower = prompt.to_lowercase();
    let mut high_hits = 0usize;
    let mut low_hits = 0usize;
    for word in lower.split(|c: char| !(c.is_alphanumeric() || c == '-')) {
        if HIGH_KEYWORDS.contains(&word) {
            high_hits += 1;
        } else if LOW_KEYWORDS.contains(&word) {
            low_hits += 1;
        }
    }

    if high_hits >= 2 || prompt.len() > HIGH_LENGTH {
        Complexity::High
    } else if low_hits > 0 && high_hits == 0 && prompt.len() < LOW_LENGTH {
        Complexity::Low
    } else {
        Complexity::Medium
    }
}

/// Rough token estimate for cost comparison: prompt chars / 4 plus the output budget.
pub fn estimate_tokens(prompt: &str, max_tokens: u32) -> u64 {
    (prompt.chars().count() / 4) as u64 + 1 + u64::from(max_tokens)
}

/// A provider eligible for the current request.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub profile: &'a ProviderProfile,
    /// successes / requests, 1.0 with no history.
    pub reliability: f64,
}

/// Pick the candidate at `counter % len`.
pub fn round_robin<'a>(candidates: &[Candidate<'a>], counter: usize) -> Option<&'a str> {
    if candidates.is_empty() {
        return None;
    }
    Some(candidates[counter % candidates.len()].name)
}

fn estimated_cost(candidate: &Candidate<'_>, prompt: &str, options: &RequestOptions) -> f64 {
    let max_tokens = options.max_tokens.unwrap_or(candidate.profile.max_tokens);
    estimate_tokens(prompt, max_tokens) as f64 * candidate.profile.cost_per_token
}

/// Lowest estimated cost wins; the first registered wins ties.
pub fn cheapest<'a>(
    candidates: &[Candidate<'a>],
    prompt: &str,
    options: &RequestOptions,
) -> Option<&'a str> {
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let cost = estimated_cost(candidate, prompt, options);
        match best {
            Some((_, best_cost)) if cost >= best_cost => {}
            _ => best = Some((candidate.name, cost)),
        }
    }
    best.map(|(name, _)| name)
}

/// Composite characteristic score of one candidate.
pub fn characteristic_score(
    candidate: &Candidate<'_>,
    complexity: Complexity,
    options: &RequestOptions,
    policy: &ScoringPolicy,
    is_cheapest: bool,
) -> f64 {
    let tier = candidate.profile.tier;
    let mut score = candidate.profile.affinity;

    let preferred = complexity.preferred_tier();
    if tier == preferred {
        score += policy.complexity_match;
    } else if tier_distance(tier, preferred) == 1 {
        score += policy.complexity_partial;
    }

    if options.speed_priority && tier == ModelTier::Fast {
        score += policy.speed_bonus;
    }
    if options.quality_priority && tier == ModelTier::Premium {
        score += policy.quality_bonus;
    }
    if options.cost_priority && is_cheapest {
        score += policy.cost_bonus;
    }

    score * candidate.reliability
}

fn tier_rank(tier: ModelTier) -> i8 {
    match tier {
        ModelTier::Fast => 0,
        ModelTier::Balanced => 1,
        ModelTier::Premium => 2,
    }
}

fn tier_distance(a: ModelTier, b: ModelTier) -> u8 {
    (tier_rank(a) - tier_rank(b)).unsigned_abs()
}

/// Highest composite score wins; ties resolve to registration order.
pub fn best_by_characteristics<'a>(
    candidates: &[Candidate<'a>],
    prompt: &str,
    options: &RequestOptions,
    policy: &ScoringPolicy,
) -> Option<&'a str> {
    let complexity = classify_complexity(prompt);

    let lowest_cost = candidates
        .iter()
        .map(|c| c.profile.cost_per_token)
        .fold(f64::INFINITY, f64::min);

    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let is_cheapest = candidate.profile.cost_per_token <= lowest_cost;
        let score = characteristic_score(candidate, complexity, options, policy, is_cheapest);
        tracing::debug!(provider = candidate.name, score, ?complexity, "Scored provider");
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate.name, score)),
        }
    }
    best.map(|(name, _)| name)
}
