mod config;

use clap::{Parser, Subcommand};
use config::{LeadflowConfig, LeadsFile};
use leadflow_core::ProcessingStatus;
use leadflow_pipeline::{
    enqueue_lead, register_lead_processing, reprocess_lead, FollowUpQueues, InMemoryLeadStore, LeadPipeline,
    QueueFollowUps, TemplatePromptRenderer, AI_PROCESSING_QUEUE,
};
use leadflow_providers::ProviderOrchestrator;
use leadflow_queue::{JobOptions, QueueManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "leadflow", about = "Leadflow AI processing core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "leadflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a JSON file of campaigns and leads
    Process {
        /// JSON file with `campaigns` and `leads` arrays
        #[arg(short, long)]
        leads: PathBuf,
        /// Give up waiting for the queue after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
        /// Reprocess failed leads once after the first pass
        #[arg(long)]
        retry_failed: bool,
    },
    /// Inspect configured providers
    Providers {
        /// Ping every provider
        #[arg(long)]
        check: bool,
    },
    /// Inspect or control a queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Print counts for the given queues
    Stats {
        #[arg(default_values_t = default_queue_names())]
        queues: Vec<String>,
    },
    /// Stop dispatching new jobs from a queue
    Pause { queue: String },
    /// Resume dispatching
    Resume { queue: String },
    /// Remove finished jobs older than the grace period
    Clean {
        queue: String,
        #[arg(long, default_value_t = 3600)]
        grace_secs: u64,
    },
}

fn default_queue_names() -> Vec<String> {
    let follow_ups = FollowUpQueues::default();
    vec![
        AI_PROCESSING_QUEUE.to_string(),
        follow_ups.email_queue,
        follow_ups.export_queue,
        follow_ups.analytics_queue,
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = LeadflowConfig::load(&cli.config).await?;
    config.apply_env();

    match cli.command {
        Commands::Process {
            leads,
            timeout_secs,
            retry_failed,
        } => process(config, leads, Duration::from_secs(timeout_secs), retry_failed).await,
        Commands::Providers { check } => providers(config, check).await,
        Commands::Queue { action } => queue(config, action).await,
    }
}

async fn build_orchestrator(config: &LeadflowConfig) -> anyhow::Result<Arc<ProviderOrchestrator>> {
    let orchestrator = ProviderOrchestrator::from_config(config.orchestrator.clone(), config.provider_configs()).await;
    if orchestrator.is_empty() {
        anyhow::bail!("No AI providers could be registered. Configure [[providers]] with an api_key or api_key_env");
    }
    info!(providers = ?orchestrator.provider_names(), "Provider orchestrator ready");
    Ok(Arc::new(orchestrator))
}

async fn process(config: LeadflowConfig, leads: PathBuf, timeout: Duration, retry_failed: bool) -> anyhow::Result<()> {
    let input = LeadsFile::load(&leads).await?;
    let store = Arc::new(InMemoryLeadStore::new());
    for campaign in input.campaigns {
        store.insert_campaign(campaign);
    }
    let lead_ids: Vec<_> = input.leads.iter().map(|lead| lead.id).collect();
    for lead in input.leads {
        store.insert_lead(lead);
    }

    let orchestrator = build_orchestrator(&config).await?;
    let queues = Arc::new(QueueManager::connect(config.queue.clone()).await);
    info!(backend = %queues.kind(), "Queue manager ready");

    let pipeline = Arc::new(LeadPipeline::new(
        orchestrator.clone(),
        store.clone(),
        Arc::new(TemplatePromptRenderer::new()),
        Arc::new(QueueFollowUps::new(queues.clone())),
        config.pipeline.clone(),
    ));
    register_lead_processing(&queues, pipeline.clone()).await?;

    for &lead_id in &lead_ids {
        enqueue_lead(&queues, store.as_ref(), lead_id, JobOptions::default()).await?;
    }
    let poll = Duration::from_millis(250);
    queues.wait_idle(AI_PROCESSING_QUEUE, poll, timeout).await?;

    if retry_failed {
        let failed: Vec<_> = store
            .leads()
            .into_iter()
            .filter(|lead| lead.ai_processing_status == ProcessingStatus::Failed)
            .map(|lead| lead.id)
            .collect();
        if !failed.is_empty() {
            warn!(count = failed.len(), "Reprocessing failed leads");
            for lead_id in failed {
                reprocess_lead(&queues, store.as_ref(), lead_id).await?;
            }
            queues.wait_idle(AI_PROCESSING_QUEUE, poll, timeout).await?;
        }
    }

    let leads: Vec<_> = lead_ids
        .iter()
        .filter_map(|&id| store.lead(id))
        .map(|lead| {
            serde_json::json!({
                "id": lead.id,
                "status": lead.ai_processing_status,
                "retry_count": lead.retry_count,
                "last_error": lead.last_error,
                "result": lead.ai_result,
            })
        })
        .collect();
    let report = serde_json::json!({
        "leads": leads,
        "pipeline": pipeline.monitor().to_json(),
        "providers": orchestrator.status_json(),
        "queues": queues.stats_json().await?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    queues.close().await?;
    Ok(())
}

async fn providers(config: LeadflowConfig, check: bool) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(&config).await?;

    println!("Registered providers:");
    for descriptor in orchestrator.descriptors() {
        println!(
            "  {} ({}, {:?}) vision={} structured={} cost/token={}",
            descriptor.name,
            descriptor.model,
            descriptor.tier,
            descriptor.vision,
            descriptor.structured_output,
            descriptor.cost_per_token
        );
    }

    if check {
        println!("\nHealth:");
        let mut unhealthy = 0;
        for (name, healthy) in orchestrator.health_check_all().await {
            if !healthy {
                unhealthy += 1;
            }
            println!("  {name}: {}", if healthy { "ok" } else { "unreachable" });
        }
        if unhealthy > 0 {
            anyhow::bail!("{unhealthy} provider(s) failed the health check");
        }
    }
    Ok(())
}

async fn queue(config: LeadflowConfig, action: QueueAction) -> anyhow::Result<()> {
    let queues = QueueManager::connect(config.queue).await;
    match action {
        QueueAction::Stats { queues: names } => {
            let mut report = serde_json::Map::new();
            for name in names {
                let stats = queues.get_stats(&name).await?;
                report.insert(name, serde_json::to_value(stats)?);
            }
            let report = serde_json::json!({ "backend": queues.kind(), "queues": report });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        QueueAction::Pause { queue } => {
            queues.pause(&queue).await?;
            println!("Paused {queue}");
        }
        QueueAction::Resume { queue } => {
            queues.resume(&queue).await?;
            println!("Resumed {queue}");
        }
        QueueAction::Clean { queue, grace_secs } => {
            let removed = queues.clean(&queue, Duration::from_secs(grace_secs)).await?;
            println!("Removed {removed} finished job(s) from {queue}");
        }
    }
    queues.close().await?;
    Ok(())
}
