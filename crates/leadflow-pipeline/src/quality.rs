//! Quality scoring over the generated outputs.
//!
//! Each sub-score is in `[0, 1]`: half for being present, half scaled by
//! length up to a target size.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const ANALYSIS_TARGET_CHARS: usize = 300;
const RESPONSE_TARGET_CHARS: usize = 500;
const EMAIL_BODY_TARGET_CHARS: usize = 300;

/// Weights of the three sub-scores. They sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    pub analysis: f64,
    pub response: f64,
    pub email: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            analysis: 0.4,
            response: 0.4,
            email: 0.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub analysis: f64,
    pub response: f64,
    pub email: f64,
    pub overall: f64,
    pub passed: bool,
}

impl QualityReport {
    pub fn from_scores(analysis: f64, response: f64, email: f64, weights: QualityWeights, threshold: f64) -> Self {
        let overall = (weights.analysis * analysis.clamp(0.0, 1.0)
            + weights.response * response.clamp(0.0, 1.0)
            + weights.email * email.clamp(0.0, 1.0))
        .clamp(0.0, 1.0);
        Self {
            analysis,
            response,
            email,
            overall,
            passed: overall >= threshold,
        }
    }
}

fn length_score(chars: usize, target: usize) -> f64 {
    if chars == 0 {
        return 0.0;
    }
    0.5 + 0.5 * (chars as f64 / target as f64).min(1.0)
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::String(s) => s.trim().chars().count(),
        Value::Object(map) if map.is_empty() => 0,
        Value::Array(items) if items.is_empty() => 0,
        other => other.to_string().chars().count(),
    }
}

pub fn analysis_score(analysis: Option<&Value>) -> f64 {
    analysis.map_or(0.0, |v| length_score(text_len(v), ANALYSIS_TARGET_CHARS))
}

pub fn response_score(response: Option<&Value>) -> f64 {
    response.map_or(0.0, |v| length_score(text_len(v), RESPONSE_TARGET_CHARS))
}

/// 0.3 for a subject, 0.3 for a body, 0.4 scaled by body length.
pub fn email_score(email: Option<&Value>) -> f64 {
    let Some(email) = email else {
        return 0.0;
    };
    let subject = email.get("subject").map_or(0, text_len);
    let body = email.get("body").map_or(0, text_len);
    let mut score = 0.0;
    if subject > 0 {
        score += 0.3;
    }
    if body > 0 {
        score += 0.3 + 0.4 * (body as f64 / EMAIL_BODY_TARGET_CHARS as f64).min(1.0);
    }
    score
}

/// Score the three outputs and compare against `threshold`.
pub fn assess(
    analysis: Option<&Value>,
    response: Option<&Value>,
    email: Option<&Value>,
    weights: QualityWeights,
    threshold: f64,
) -> QualityReport {
    QualityReport::from_scores(
        analysis_score(analysis),
        response_score(response),
        email_score(email),
        weights,
        threshold,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_perfect_scores() {
        let report = QualityReport::from_scores(1.0, 1.0, 1.0, QualityWeights::default(), 0.6);
        assert!((report.overall - 1.0).abs() < 1e-9);
        assert!(report.passed);
    }

    #[test]
    fn test_missing_analysis_caps_overall() {
        let report = QualityReport::from_scores(0.0, 1.0, 1.0, QualityWeights::default(), 0.6);
        assert!(report.overall <= 0.6 + 1e-9);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let long = "x".repeat(10_000);
        let report = assess(
            Some(&json!({"summary": long})),
            Some(&json!(long)),
            Some(&json!({"subject": "Hi", "body": long})),
            QualityWeights::default(),
            0.6,
        );
        for score in [report.analysis, report.response, report.email, report.overall] {
            assert!((0.0..=1.0).contains(&score));
        }
        assert!((report.overall - 1.0).abs() < 1e-9);

        let empty = assess(None, Some(&json!("   ")), Some(&json!({})), QualityWeights::default(), 0.6);
        assert_eq!(empty.overall, 0.0);
        assert!(!empty.passed);
    }

    #[test]
    fn test_short_outputs_score_partially() {
        let score = response_score(Some(&json!("Thanks!")));
        assert!(score > 0.5 && score < 0.6);
        assert!((email_score(Some(&json!({"subject": "Hi"}))) - 0.3).abs() < 1e-9);
    }
}
