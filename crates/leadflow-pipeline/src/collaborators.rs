//! Narrow interfaces to the systems the pipeline depends on.

use crate::stage::Stage;
use async_trait::async_trait;
use leadflow_core::{Campaign, CampaignId, Lead, LeadId, LeadflowError, LeadflowResult, ProcessingStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Partial update of a lead's AI fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadUpdate {
    pub status: Option<ProcessingStatus>,
    pub ai_result: Option<serde_json::Value>,
    pub ai_analysis: Option<serde_json::Value>,
    pub processing_metadata: Option<serde_json::Value>,
    pub retry_count: Option<u32>,
    /// `Some(None)` clears the stored error.
    pub last_error: Option<Option<String>>,
}

impl LeadUpdate {
    pub fn status(status: ProcessingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.ai_result = Some(result);
        self
    }

    pub fn with_analysis(mut self, analysis: serde_json::Value) -> Self {
        self.ai_analysis = Some(analysis);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.processing_metadata = Some(metadata);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn apply(&self, lead: &mut Lead) {
        if let Some(status) = self.status {
            lead.ai_processing_status = status;
        }
        if let Some(result) = &self.ai_result {
            lead.ai_result = Some(result.clone());
        }
        if let Some(analysis) = &self.ai_analysis {
            lead.ai_analysis = Some(analysis.clone());
        }
        if let Some(metadata) = &self.processing_metadata {
            lead.processing_metadata = Some(metadata.clone());
        }
        if let Some(retry_count) = self.retry_count {
            lead.retry_count = retry_count;
        }
        if let Some(error) = &self.last_error {
            lead.last_error = error.clone();
        }
    }
}

/// Lead and campaign persistence.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn load_lead(&self, id: LeadId) -> LeadflowResult<Lead>;

    async fn load_campaign(&self, id: CampaignId) -> LeadflowResult<Campaign>;

    async fn update_lead(&self, id: LeadId, update: LeadUpdate) -> LeadflowResult<()>;
}

/// Builds the prompt for a provider-backed stage.
pub trait PromptRenderer: Send + Sync {
    /// `context` carries the outputs of earlier stages.
    fn render(
        &self,
        stage: Stage,
        lead: &Lead,
        campaign: &Campaign,
        context: &serde_json::Value,
    ) -> LeadflowResult<String>;
}

/// Accepts follow-up work produced by finalization.
#[async_trait]
pub trait FollowUpSink: Send + Sync {
    async fn enqueue(&self, queue: &str, job_type: &str, payload: serde_json::Value) -> LeadflowResult<()>;
}

/// Receives progress percentages (0-100).
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8) {}
}

/// Discards follow-ups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFollowUps;

#[async_trait]
impl FollowUpSink for NoFollowUps {
    async fn enqueue(&self, _queue: &str, _job_type: &str, _payload: serde_json::Value) -> LeadflowResult<()> {
        Ok(())
    }
}

/// Leads and campaigns held in memory.
#[derive(Default)]
pub struct InMemoryLeadStore {
    leads: RwLock<HashMap<LeadId, Lead>>,
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_lead(&self, lead: Lead) {
        self.leads.write().insert(lead.id, lead);
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.write().insert(campaign.id, campaign);
    }

    /// Current copy of a lead.
    pub fn lead(&self, id: LeadId) -> Option<Lead> {
        self.leads.read().get(&id).cloned()
    }

    pub fn leads(&self) -> Vec<Lead> {
        let mut leads: Vec<Lead> = self.leads.read().values().cloned().collect();
        leads.sort_by_key(|l| l.id);
        leads
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn load_lead(&self, id: LeadId) -> LeadflowResult<Lead> {
        self.lead(id)
            .ok_or_else(|| LeadflowError::NotFound(format!("lead {id}")))
    }

    async fn load_campaign(&self, id: CampaignId) -> LeadflowResult<Campaign> {
        self.campaigns
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| LeadflowError::NotFound(format!("campaign {id}")))
    }

    async fn update_lead(&self, id: LeadId, update: LeadUpdate) -> LeadflowResult<()> {
        let mut leads = self.leads.write();
        let lead = leads
            .get_mut(&id)
            .ok_or_else(|| LeadflowError::NotFound(format!("lead {id}")))?;
        update.apply(lead);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_applies_only_set_fields() {
        let store = InMemoryLeadStore::new();
        store.insert_lead(Lead::new(1, 1, "Ada"));

        store
            .update_lead(
                1,
                LeadUpdate::status(ProcessingStatus::Failed)
                    .with_error("boom")
                    .with_retry_count(2),
            )
            .await
            .unwrap();
        let lead = store.load_lead(1).await.unwrap();
        assert_eq!(lead.ai_processing_status, ProcessingStatus::Failed);
        assert_eq!(lead.last_error.as_deref(), Some("boom"));
        assert_eq!(lead.retry_count, 2);

        store
            .update_lead(1, LeadUpdate::status(ProcessingStatus::Queued).clear_error())
            .await
            .unwrap();
        let lead = store.load_lead(1).await.unwrap();
        assert!(lead.last_error.is_none());
        assert_eq!(lead.retry_count, 2);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let store = InMemoryLeadStore::new();
        assert!(matches!(
            store.load_campaign(9).await.unwrap_err(),
            LeadflowError::NotFound(_)
        ));
        assert!(store
            .update_lead(9, LeadUpdate::default())
            .await
            .is_err());
    }
}
