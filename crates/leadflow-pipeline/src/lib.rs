//! Lead processing pipeline for Leadflow.
//!
//! [`LeadPipeline`] drives one lead through
//! `initialization → analysis → response_generation → email_generation →
//! validation → finalization`, calling the provider orchestrator for the AI
//! stages. Analysis and response generation are critical; a failed email is
//! replaced by a fixed template. The `jobs` module connects the pipeline to
//! the queue subsystem.

pub mod collaborators;
pub mod context;
pub mod engine;
pub mod jobs;
pub mod monitor;
pub mod prompts;
pub mod quality;
pub mod stage;

pub use collaborators::{
    FollowUpSink, InMemoryLeadStore, LeadStore, LeadUpdate, NoFollowUps, NoProgress, ProgressSink,
    PromptRenderer,
};
pub use context::{ProcessingContext, StageNote};
pub use engine::{
    fallback_email, FollowUpQueues, LeadPipeline, PipelineConfig, PipelineOutcome, StageRequests,
};
pub use jobs::{
    enqueue_lead, register_lead_processing, reprocess_lead, LeadJobHandler, LeadJobPayload,
    QueueFollowUps, AI_PROCESSING_QUEUE, PROCESS_LEAD,
};
pub use monitor::{PipelineCounters, PipelineMonitor};
pub use prompts::TemplatePromptRenderer;
pub use quality::{QualityReport, QualityWeights};
pub use stage::{Stage, StageResult};
