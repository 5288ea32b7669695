use crate::collaborators::{FollowUpSink, LeadStore, LeadUpdate, ProgressSink, PromptRenderer};
use crate::context::{ProcessingContext, StageNote};
use crate::monitor::PipelineMonitor;
use crate::quality::{assess, QualityReport, QualityWeights};
use crate::stage::{Stage, StageResult};
use chrono::Utc;
use leadflow_core::{Campaign, Lead, LeadId, LeadflowError, LeadflowResult, ProcessingStatus, Usage};
use leadflow_providers::{Completion, ProviderOrchestrator, RequestOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Queue names and job types for follow-up work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpQueues {
    #[serde(default = "default_email_queue")]
    pub email_queue: String,
    #[serde(default = "default_export_queue")]
    pub export_queue: String,
    #[serde(default = "default_analytics_queue")]
    pub analytics_queue: String,
}

fn default_email_queue() -> String {
    "email-delivery".to_string()
}

fn default_export_queue() -> String {
    "sheets-export".to_string()
}

fn default_analytics_queue() -> String {
    "analytics".to_string()
}

impl Default for FollowUpQueues {
    fn default() -> Self {
        Self {
            email_queue: default_email_queue(),
            export_queue: default_export_queue(),
            analytics_queue: default_analytics_queue(),
        }
    }
}

pub const SEND_FOLLOW_UP: &str = "send-follow-up";
pub const EXPORT_LEAD: &str = "export-lead";
pub const TRACK_EVENT: &str = "track-event";

/// Request options per provider-backed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRequests {
    #[serde(default = "default_analysis_request")]
    pub analysis: RequestOptions,
    #[serde(default = "default_response_request")]
    pub response: RequestOptions,
    #[serde(default = "default_email_request")]
    pub email: RequestOptions,
}

fn default_analysis_request() -> RequestOptions {
    RequestOptions::default().with_temperature(0.3).quality()
}

fn default_response_request() -> RequestOptions {
    RequestOptions::default().with_temperature(0.7).quality()
}

fn default_email_request() -> RequestOptions {
    RequestOptions::default().with_temperature(0.7).speed()
}

impl Default for StageRequests {
    fn default() -> Self {
        Self {
            analysis: default_analysis_request(),
            response: default_response_request(),
            email: default_email_request(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Overall quality below this is recorded as a warning.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    #[serde(default)]
    pub quality_weights: QualityWeights,
    /// Fixed delay before retrying a retryable failure. `None` uses the queue backoff.
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    #[serde(default)]
    pub follow_ups: FollowUpQueues,
    #[serde(default)]
    pub requests: StageRequests,
}

fn default_quality_threshold() -> f64 {
    0.6
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            quality_weights: QualityWeights::default(),
            retry_delay_secs: None,
            follow_ups: FollowUpQueues::default(),
            requests: StageRequests::default(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_secs.map(Duration::from_secs)
    }
}

/// Schema requested from the analysis stage.
pub fn analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "interests": {"type": "array", "items": {"type": "string"}},
            "pain_points": {"type": "array", "items": {"type": "string"}},
            "intent": {"type": "string", "enum": ["low", "medium", "high"]}
        },
        "required": ["summary"]
    })
}

/// Schema requested from the email stage.
pub fn email_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "subject": {"type": "string"},
            "body": {"type": "string"}
        },
        "required": ["subject", "body"]
    })
}

/// Deterministic email used when generation fails.
pub fn fallback_email(lead: &Lead, campaign: &Campaign) -> Value {
    json!({
        "subject": format!("Your {} results", campaign.name),
        "body": format!(
            "Hi {},\n\nThanks for completing {}. Your personalised results are ready, \
             and we will be in touch shortly with recommendations based on your answers.\n\n\
             Best regards,\nThe {} team",
            lead.name, campaign.name, campaign.name
        ),
    })
}

/// Result of a successful invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub context_id: Uuid,
    pub lead_id: LeadId,
    /// The record persisted as the lead's `ai_result`.
    pub result: Value,
    pub quality: QualityReport,
    pub warnings: Vec<StageNote>,
    pub usage: Usage,
    pub cost: f64,
    pub processing_time_ms: u64,
}

fn completion_result(value: Value, completion: &Completion) -> StageResult {
    StageResult {
        result: value,
        provider: Some(completion.provider.clone()),
        model: Some(completion.model.clone()),
        usage: completion.usage,
        cost: completion.cost,
        processing_time_ms: 0,
        fallback: false,
    }
}

/// Drives one lead through the stages.
pub struct LeadPipeline {
    orchestrator: Arc<ProviderOrchestrator>,
    store: Arc<dyn LeadStore>,
    renderer: Arc<dyn PromptRenderer>,
    follow_ups: Arc<dyn FollowUpSink>,
    monitor: Arc<PipelineMonitor>,
    config: PipelineConfig,
}

impl LeadPipeline {
    pub fn new(
        orchestrator: Arc<ProviderOrchestrator>,
        store: Arc<dyn LeadStore>,
        renderer: Arc<dyn PromptRenderer>,
        follow_ups: Arc<dyn FollowUpSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            renderer,
            follow_ups,
            monitor: Arc::new(PipelineMonitor::new()),
            config,
        }
    }

    pub fn monitor(&self) -> &Arc<PipelineMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LeadStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<ProviderOrchestrator> {
        &self.orchestrator
    }

    /// Run every stage for `lead_id`. `attempt` is the queue run number (1-based).
    ///
    /// On a critical failure the lead is persisted as failed and the stage
    /// error is returned for the queue to settle.
    pub async fn process_lead(
        &self,
        lead_id: LeadId,
        attempt: u32,
        progress: &dyn ProgressSink,
    ) -> LeadflowResult<PipelineOutcome> {
        info!(lead_id, attempt, "Pipeline started");
        let init_start = Instant::now();

        let mut ctx = match self.initialize(lead_id, attempt, progress).await {
            Ok(ctx) => ctx,
            Err(e) => {
                let elapsed = init_start.elapsed().as_millis() as f64;
                error!(stage = %Stage::Initialization, lead_id, error = %e, "Pipeline initialization failed");
                self.monitor.record_stage_failure(Stage::Initialization, elapsed);
                self.monitor.record_rejected(elapsed);
                self.persist_failure(lead_id, attempt, &e, None).await;
                return Err(e);
            }
        };

        match self.run_stages(&mut ctx, progress).await {
            Ok(outcome) => {
                self.monitor.finish_success(
                    ctx.id,
                    outcome.processing_time_ms as f64,
                    outcome.cost,
                    u64::from(outcome.usage.total_tokens),
                );
                info!(
                    lead_id,
                    context_id = %ctx.id,
                    quality = outcome.quality.overall,
                    warnings = outcome.warnings.len(),
                    processing_time_ms = outcome.processing_time_ms,
                    "Pipeline completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    stage = ctx.current_stage.map(Stage::as_str).unwrap_or("unknown"),
                    lead_id,
                    context_id = %ctx.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Pipeline aborted"
                );
                self.monitor.finish_failure(ctx.id, ctx.elapsed_ms() as f64);
                self.persist_failure(lead_id, attempt, &e, Some(ctx.metadata())).await;
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        lead_id: LeadId,
        attempt: u32,
        progress: &dyn ProgressSink,
    ) -> LeadflowResult<ProcessingContext> {
        let wrap = |e: LeadflowError| LeadflowError::stage(Stage::Initialization.as_str(), true, e);
        let start = Instant::now();

        let lead = self.store.load_lead(lead_id).await.map_err(wrap)?;
        let campaign = self.store.load_campaign(lead.campaign_id).await.map_err(wrap)?;

        let mut ctx = ProcessingContext::new(lead, campaign, attempt);
        ctx.enter(Stage::Initialization).map_err(wrap)?;
        progress.report(Stage::Initialization.progress());

        self.store
            .update_lead(
                lead_id,
                LeadUpdate::status(ProcessingStatus::Processing)
                    .with_retry_count(attempt.saturating_sub(1))
                    .clear_error(),
            )
            .await
            .map_err(wrap)?;

        // Only runs that got past initialization are tracked as active.
        self.monitor.start(ctx.id, lead_id);
        self.monitor.enter_stage(ctx.id, Stage::Initialization);

        let elapsed = start.elapsed().as_millis() as u64;
        self.monitor
            .record_stage_success(Stage::Initialization, elapsed as f64, 0.0, 0);
        let summary = json!({
            "lead_id": ctx.lead.id,
            "campaign_id": ctx.campaign.id,
            "campaign_type": ctx.campaign.campaign_type,
        });
        ctx.record(Stage::Initialization, StageResult::local(summary, elapsed));
        Ok(ctx)
    }

    async fn run_stages(
        &self,
        ctx: &mut ProcessingContext,
        progress: &dyn ProgressSink,
    ) -> LeadflowResult<PipelineOutcome> {
        self.begin(ctx, Stage::Analysis, progress)?;
        let start = Instant::now();
        let outcome = self.analyze(ctx).await;
        self.settle(ctx, Stage::Analysis, start, outcome)?;

        self.begin(ctx, Stage::ResponseGeneration, progress)?;
        let start = Instant::now();
        let outcome = self.generate_response(ctx).await;
        self.settle(ctx, Stage::ResponseGeneration, start, outcome)?;

        self.begin(ctx, Stage::EmailGeneration, progress)?;
        let start = Instant::now();
        let outcome = self.generate_email(ctx).await;
        if self.settle(ctx, Stage::EmailGeneration, start, outcome).is_err() {
            self.monitor.record_fallback_email();
            let fallback = StageResult {
                fallback: true,
                ..StageResult::local(
                    fallback_email(&ctx.lead, &ctx.campaign),
                    start.elapsed().as_millis() as u64,
                )
            };
            ctx.record(Stage::EmailGeneration, fallback);
        }

        self.begin(ctx, Stage::Validation, progress)?;
        let start = Instant::now();
        let quality = self.validate(ctx);
        ctx.record(
            Stage::Validation,
            StageResult::local(json!(quality), start.elapsed().as_millis() as u64),
        );

        self.begin(ctx, Stage::Finalization, progress)?;
        let start = Instant::now();
        let result = match self.finalize(ctx, quality).await {
            Ok(result) => result,
            Err(e) => return Err(self.stage_failure(ctx, Stage::Finalization, start, e)),
        };

        Ok(PipelineOutcome {
            context_id: ctx.id,
            lead_id: ctx.lead.id,
            result,
            quality,
            warnings: ctx.warnings.clone(),
            usage: ctx.usage(),
            cost: ctx.cost(),
            processing_time_ms: ctx.elapsed_ms(),
        })
    }

    fn begin(&self, ctx: &mut ProcessingContext, stage: Stage, progress: &dyn ProgressSink) -> LeadflowResult<()> {
        ctx.enter(stage)?;
        self.monitor.enter_stage(ctx.id, stage);
        progress.report(stage.progress());
        Ok(())
    }

    /// Record a provider-backed stage's outcome. Errors come back wrapped as stage errors.
    fn settle(
        &self,
        ctx: &mut ProcessingContext,
        stage: Stage,
        start: Instant,
        outcome: LeadflowResult<StageResult>,
    ) -> LeadflowResult<()> {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut result) => {
                result.processing_time_ms = elapsed_ms;
                self.monitor.record_stage_success(
                    stage,
                    elapsed_ms as f64,
                    result.cost,
                    u64::from(result.usage.total_tokens),
                );
                ctx.record(stage, result);
                Ok(())
            }
            Err(e) => Err(self.stage_failure(ctx, stage, start, e)),
        }
    }

    fn stage_failure(&self, ctx: &mut ProcessingContext, stage: Stage, start: Instant, e: LeadflowError) -> LeadflowError {
        self.monitor
            .record_stage_failure(stage, start.elapsed().as_millis() as f64);
        if stage.is_critical() {
            error!(stage = %stage, lead_id = ctx.lead.id, error = %e, "Critical stage failed");
            ctx.error(stage, e.to_string());
        } else {
            warn!(stage = %stage, lead_id = ctx.lead.id, error = %e, "Stage failed, using fallback");
            ctx.warn(stage, e.to_string());
        }
        LeadflowError::stage(stage.as_str(), stage.is_critical(), e)
    }

    async fn analyze(&self, ctx: &ProcessingContext) -> LeadflowResult<StageResult> {
        let prompt = self
            .renderer
            .render(Stage::Analysis, &ctx.lead, &ctx.campaign, &json!({}))?;
        let completion = self
            .orchestrator
            .generate_structured(&prompt, &analysis_schema(), &self.config.requests.analysis)
            .await?;
        let analysis = completion
            .structured
            .clone()
            .ok_or_else(|| LeadflowError::Validation("analysis returned no JSON".into()))?;
        Ok(completion_result(analysis, &completion))
    }

    async fn generate_response(&self, ctx: &ProcessingContext) -> LeadflowResult<StageResult> {
        let analysis = ctx.output(Stage::Analysis).cloned().unwrap_or(Value::Null);
        let prompt = self.renderer.render(
            Stage::ResponseGeneration,
            &ctx.lead,
            &ctx.campaign,
            &json!({ "analysis": analysis }),
        )?;
        let completion = self
            .orchestrator
            .generate_text(&prompt, &self.config.requests.response)
            .await?;
        if completion.content.trim().is_empty() {
            return Err(LeadflowError::Validation("empty response".into()));
        }
        Ok(completion_result(Value::String(completion.content.clone()), &completion))
    }

    async fn generate_email(&self, ctx: &ProcessingContext) -> LeadflowResult<StageResult> {
        let stage_context = json!({
            "analysis": ctx.output(Stage::Analysis).cloned().unwrap_or(Value::Null),
            "response": ctx.output(Stage::ResponseGeneration).cloned().unwrap_or(Value::Null),
        });
        let prompt = self
            .renderer
            .render(Stage::EmailGeneration, &ctx.lead, &ctx.campaign, &stage_context)?;
        let completion = self
            .orchestrator
            .generate_structured(&prompt, &email_schema(), &self.config.requests.email)
            .await?;
        let email = completion
            .structured
            .clone()
            .filter(|v| v.get("subject").is_some() && v.get("body").is_some())
            .ok_or_else(|| LeadflowError::Validation("email needs a subject and a body".into()))?;
        Ok(completion_result(email, &completion))
    }

    fn validate(&self, ctx: &mut ProcessingContext) -> QualityReport {
        let report = assess(
            ctx.output(Stage::Analysis),
            ctx.output(Stage::ResponseGeneration),
            ctx.output(Stage::EmailGeneration),
            self.config.quality_weights,
            self.config.quality_threshold,
        );
        if !report.passed {
            warn!(
                stage = %Stage::Validation,
                lead_id = ctx.lead.id,
                score = report.overall,
                threshold = self.config.quality_threshold,
                "Quality below threshold"
            );
            self.monitor.record_low_quality();
            ctx.warn(
                Stage::Validation,
                format!(
                    "quality score {:.2} below threshold {:.2}",
                    report.overall, self.config.quality_threshold
                ),
            );
        }
        report
    }

    async fn finalize(&self, ctx: &mut ProcessingContext, quality: QualityReport) -> LeadflowResult<Value> {
        let analysis = ctx.output(Stage::Analysis).cloned().unwrap_or(Value::Null);
        let email = ctx.output(Stage::EmailGeneration).cloned().unwrap_or(Value::Null);
        let record = json!({
            "lead_id": ctx.lead.id,
            "campaign_id": ctx.campaign.id,
            "analysis": analysis,
            "response": ctx.output(Stage::ResponseGeneration).cloned().unwrap_or(Value::Null),
            "email": email,
            "email_fallback": ctx.result(Stage::EmailGeneration).is_some_and(|r| r.fallback),
            "quality": quality,
            "providers": ctx.providers(),
            "completed_at": Utc::now(),
        });

        self.store
            .update_lead(
                ctx.lead.id,
                LeadUpdate::status(ProcessingStatus::Completed)
                    .with_result(record.clone())
                    .with_analysis(analysis)
                    .with_metadata(ctx.metadata())
                    .with_retry_count(ctx.attempt.saturating_sub(1))
                    .clear_error(),
            )
            .await?;

        self.enqueue_follow_ups(ctx, &email, quality).await;
        ctx.record(Stage::Finalization, StageResult::local(json!({"persisted": true}), 0));
        Ok(record)
    }

    /// Email, export (campaigns with a sheet only) and analytics. Failures are logged.
    async fn enqueue_follow_ups(&self, ctx: &mut ProcessingContext, email: &Value, quality: QualityReport) {
        let queues = &self.config.follow_ups;
        let lead = &ctx.lead;
        let campaign = &ctx.campaign;

        let mut jobs = vec![(
            queues.email_queue.as_str(),
            SEND_FOLLOW_UP,
            json!({
                "leadId": lead.id,
                "campaignId": campaign.id,
                "email": lead.email,
                "subject": email.get("subject"),
                "body": email.get("body"),
            }),
        )];
        if let Some(sheet_id) = &campaign.google_sheet_id {
            jobs.push((
                queues.export_queue.as_str(),
                EXPORT_LEAD,
                json!({"leadId": lead.id, "campaignId": campaign.id, "sheetId": sheet_id}),
            ));
        }
        jobs.push((
            queues.analytics_queue.as_str(),
            TRACK_EVENT,
            json!({
                "leadId": lead.id,
                "campaignId": campaign.id,
                "event": "lead_processed",
                "qualityScore": quality.overall,
                "processingTimeMs": ctx.elapsed_ms(),
                "cost": ctx.cost(),
            }),
        ));

        let mut failures = Vec::new();
        for (queue, job_type, payload) in jobs {
            if let Err(e) = self.follow_ups.enqueue(queue, job_type, payload).await {
                warn!(
                    stage = %Stage::Finalization,
                    lead_id = lead.id,
                    queue,
                    job_type,
                    error = %e,
                    "Follow-up enqueue failed"
                );
                self.monitor.record_follow_up_failure();
                failures.push(format!("{queue}/{job_type}: {e}"));
            }
        }
        for failure in failures {
            ctx.warn(Stage::Finalization, failure);
        }
    }

    async fn persist_failure(&self, lead_id: LeadId, attempt: u32, err: &LeadflowError, metadata: Option<Value>) {
        let mut update = LeadUpdate::status(ProcessingStatus::Failed)
            .with_error(err.to_string())
            .with_retry_count(attempt);
        if let Some(metadata) = metadata {
            update = update.with_metadata(metadata);
        }
        if let Err(persist_err) = self.store.update_lead(lead_id, update).await {
            error!(lead_id, error = %persist_err, "Could not persist lead failure");
        }
    }
}
