use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a lead record.
pub type LeadId = u64;

/// Identifier of a campaign record.
pub type CampaignId = u64;

/// AI-processing status stored on a lead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStatus::Pending => write!(f, "pending"),
            ProcessingStatus::Queued => write!(f, "queued"),
            ProcessingStatus::Processing => write!(f, "processing"),
            ProcessingStatus::Completed => write!(f, "completed"),
            ProcessingStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A campaign respondent. Owned by the persistence collaborator; the core only
/// reads the answers and writes back the AI fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub campaign_id: CampaignId,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Quiz answers as submitted.
    #[serde(default)]
    pub answers: serde_json::Value,
    #[serde(default)]
    pub ai_processing_status: ProcessingStatus,
    #[serde(default)]
    pub ai_result: Option<serde_json::Value>,
    #[serde(default)]
    pub ai_analysis: Option<serde_json::Value>,
    #[serde(default)]
    pub processing_metadata: Option<serde_json::Value>,
    /// Externally visible retry counter, mirrored from the queue job attempts.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(id: LeadId, campaign_id: CampaignId, name: impl Into<String>) -> Self {
        Self {
            id,
            campaign_id,
            name: name.into(),
            email: None,
            answers: serde_json::Value::Null,
            ai_processing_status: ProcessingStatus::Pending,
            ai_result: None,
            ai_analysis: None,
            processing_metadata: None,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_answers(mut self, answers: serde_json::Value) -> Self {
        self.answers = answers;
        self
    }
}

/// A quiz campaign. Read-only from the core's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    #[serde(default = "default_campaign_type")]
    pub campaign_type: String,
    /// Free-form campaign configuration (prompt templates, tone, ...).
    #[serde(default)]
    pub config: serde_json::Value,
    /// Spreadsheet to export results to, if any.
    #[serde(default)]
    pub google_sheet_id: Option<String>,
}

fn default_campaign_type() -> String {
    "quiz".to_string()
}

impl Campaign {
    pub fn new(id: CampaignId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            campaign_type: default_campaign_type(),
            config: serde_json::Value::Null,
            google_sheet_id: None,
        }
    }

    pub fn with_type(mut self, campaign_type: impl Into<String>) -> Self {
        self.campaign_type = campaign_type.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_sheet(mut self, sheet_id: impl Into<String>) -> Self {
        self.google_sheet_id = Some(sheet_id.into());
        self
    }

    /// Look up a string entry in the campaign config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_defaults() {
        let lead = Lead::new(42, 7, "Ada");
        assert_eq!(lead.ai_processing_status, ProcessingStatus::Pending);
        assert_eq!(lead.retry_count, 0);
        assert!(lead.ai_result.is_none());
    }

    #[test]
    fn test_lead_deserialize_minimal() {
        let lead: Lead =
            serde_json::from_str(r#"{"id": 1, "campaign_id": 2, "name": "Grace"}"#).unwrap();
        assert_eq!(lead.name, "Grace");
        assert_eq!(lead.ai_processing_status, ProcessingStatus::Pending);
        assert!(lead.answers.is_null());
    }

    #[test]
    fn test_campaign_config_lookup() {
        let campaign = Campaign::new(1, "Fitness quiz")
            .with_config(serde_json::json!({"tone": "friendly", "limit": 3}));
        assert_eq!(campaign.config_str("tone"), Some("friendly"));
        assert_eq!(campaign.config_str("limit"), None);
        assert_eq!(campaign.campaign_type, "quiz");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessingStatus::Completed.to_string(), "completed");
        assert_eq!(
            serde_json::to_string(&ProcessingStatus::Failed).unwrap(),
            "\"failed\""
        );
    }
}
