//! Queue wiring: the `process-lead` handler and follow-up enqueueing.

use crate::collaborators::{FollowUpSink, LeadStore, LeadUpdate, ProgressSink};
use crate::engine::LeadPipeline;
use async_trait::async_trait;
use leadflow_core::{CampaignId, LeadId, LeadflowError, LeadflowResult, ProcessingStatus};
use leadflow_queue::{
    Dispatch, JobContext, JobFailure, JobHandler, JobOptions, ProgressHandle, QueueManager, RetryDirective,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const AI_PROCESSING_QUEUE: &str = "ai-processing";
pub const PROCESS_LEAD: &str = "process-lead";

/// Payload of a `process-lead` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadJobPayload {
    pub lead_id: LeadId,
    #[serde(default)]
    pub campaign_id: Option<CampaignId>,
}

impl ProgressSink for ProgressHandle {
    fn report(&self, percent: u8) {
        self.set(percent);
    }
}

/// Runs the pipeline for `process-lead` jobs.
pub struct LeadJobHandler {
    pipeline: Arc<LeadPipeline>,
}

impl LeadJobHandler {
    pub fn new(pipeline: Arc<LeadPipeline>) -> Self {
        Self { pipeline }
    }

    /// Map a pipeline error onto the queue's retry decision.
    pub fn failure(&self, err: &LeadflowError) -> JobFailure {
        let directive = if !err.is_retryable() {
            RetryDirective::Never
        } else if let Some(delay) = self.pipeline.config().retry_delay() {
            RetryDirective::After(delay)
        } else {
            RetryDirective::Backoff
        };
        JobFailure {
            error: err.to_string(),
            kind: err.kind(),
            directive,
        }
    }
}

#[async_trait]
impl JobHandler for LeadJobHandler {
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, JobFailure> {
        let payload: LeadJobPayload = serde_json::from_value(ctx.job.payload.clone())
            .map_err(|e| JobFailure::fatal(format!("invalid {PROCESS_LEAD} payload: {e}")))?;

        match self
            .pipeline
            .process_lead(payload.lead_id, ctx.job.attempts, &ctx.progress)
            .await
        {
            Ok(outcome) => Ok(serde_json::json!({
                "leadId": outcome.lead_id,
                "contextId": outcome.context_id,
                "quality": outcome.quality.overall,
                "warnings": outcome.warnings.len(),
                "cost": outcome.cost,
                "processingTimeMs": outcome.processing_time_ms,
            })),
            Err(e) => Err(self.failure(&e)),
        }
    }
}

/// Follow-up sink over the queue manager. Falls back to inline execution.
pub struct QueueFollowUps {
    queues: Arc<QueueManager>,
}

impl QueueFollowUps {
    pub fn new(queues: Arc<QueueManager>) -> Self {
        Self { queues }
    }
}

#[async_trait]
impl FollowUpSink for QueueFollowUps {
    async fn enqueue(&self, queue: &str, job_type: &str, payload: serde_json::Value) -> LeadflowResult<()> {
        match self
            .queues
            .add_job_or_run(queue, job_type, payload, JobOptions::default())
            .await?
        {
            Dispatch::Enqueued(_) => Ok(()),
            Dispatch::RanInline { outcome: Ok(_), .. } => Ok(()),
            Dispatch::RanInline { outcome: Err(failure), .. } => Err(LeadflowError::Queue(format!(
                "inline {job_type} on {queue} failed: {failure}"
            ))),
        }
    }
}

/// Register the `process-lead` handler on the AI queue.
pub async fn register_lead_processing(queues: &QueueManager, pipeline: Arc<LeadPipeline>) -> LeadflowResult<()> {
    queues
        .process(AI_PROCESSING_QUEUE, PROCESS_LEAD, Arc::new(LeadJobHandler::new(pipeline)))
        .await
}

/// Mark the lead queued and enqueue a `process-lead` job for it.
pub async fn enqueue_lead(
    queues: &QueueManager,
    store: &dyn LeadStore,
    lead_id: LeadId,
    options: JobOptions,
) -> LeadflowResult<Dispatch> {
    let lead = store.load_lead(lead_id).await?;
    store
        .update_lead(lead_id, LeadUpdate::status(ProcessingStatus::Queued))
        .await?;

    let payload = serde_json::to_value(LeadJobPayload {
        lead_id,
        campaign_id: Some(lead.campaign_id),
    })?;
    let dispatch = queues
        .add_job_or_run(AI_PROCESSING_QUEUE, PROCESS_LEAD, payload, options)
        .await?;
    match &dispatch {
        Dispatch::Enqueued(job) => info!(lead_id, job_id = %job.id, "Lead queued for processing"),
        Dispatch::RanInline { job, .. } => {
            warn!(lead_id, job_id = %job.id, status = %job.status, "Lead processed inline");
        }
    }
    Ok(dispatch)
}

/// Reset a lead's AI state and enqueue a fresh job.
///
/// Rejected while the lead is being processed.
pub async fn reprocess_lead(
    queues: &QueueManager,
    store: &dyn LeadStore,
    lead_id: LeadId,
) -> LeadflowResult<Dispatch> {
    let lead = store.load_lead(lead_id).await?;
    if lead.ai_processing_status == ProcessingStatus::Processing {
        return Err(LeadflowError::InvalidState(format!(
            "lead {lead_id} is already being processed"
        )));
    }
    store
        .update_lead(
            lead_id,
            LeadUpdate::status(ProcessingStatus::Pending)
                .with_retry_count(0)
                .clear_error(),
        )
        .await?;
    info!(lead_id, previous = %lead.ai_processing_status, "Reprocessing lead");
    enqueue_lead(queues, store, lead_id, JobOptions::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_uses_camel_case() {
        let payload: LeadJobPayload = serde_json::from_value(serde_json::json!({"leadId": 42})).unwrap();
        assert_eq!(payload.lead_id, 42);
        assert_eq!(payload.campaign_id, None);

        let value = serde_json::to_value(LeadJobPayload {
            lead_id: 1,
            campaign_id: Some(2),
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"leadId": 1, "campaignId": 2}));
    }

    #[test]
    fn test_progress_handle_is_a_sink() {
        let handle = ProgressHandle::new();
        let sink: &dyn ProgressSink = &handle;
        sink.report(66);
        assert_eq!(handle.get(), 66);
    }
}
