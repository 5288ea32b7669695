use crate::stage::{Stage, StageResult};
use chrono::{DateTime, Utc};
use leadflow_core::{Campaign, LeadflowError, LeadflowResult, Lead, Usage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// A warning or error attributed to a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageNote {
    pub stage: Stage,
    pub message: String,
}

/// State of one pipeline invocation. Discarded after finalization.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingContext {
    pub id: Uuid,
    pub lead: Lead,
    pub campaign: Campaign,
    /// Queue run number this invocation belongs to.
    pub attempt: u32,
    pub current_stage: Option<Stage>,
    pub stage_results: BTreeMap<Stage, StageResult>,
    pub errors: Vec<StageNote>,
    pub warnings: Vec<StageNote>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    start: Instant,
    #[serde(skip)]
    entered: Vec<Stage>,
}

impl ProcessingContext {
    pub fn new(lead: Lead, campaign: Campaign, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead,
            campaign,
            attempt,
            current_stage: None,
            stage_results: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now(),
            start: Instant::now(),
            entered: Vec::new(),
        }
    }

    /// Enter `stage`. Each stage can be entered once per invocation.
    pub fn enter(&mut self, stage: Stage) -> LeadflowResult<()> {
        if self.entered.contains(&stage) {
            return Err(LeadflowError::InvalidState(format!(
                "stage {stage} already entered for context {}",
                self.id
            )));
        }
        self.entered.push(stage);
        self.current_stage = Some(stage);
        Ok(())
    }

    pub fn record(&mut self, stage: Stage, result: StageResult) {
        self.stage_results.insert(stage, result);
    }

    pub fn result(&self, stage: Stage) -> Option<&StageResult> {
        self.stage_results.get(&stage)
    }

    /// The stage's output value, if it produced one.
    pub fn output(&self, stage: Stage) -> Option<&serde_json::Value> {
        self.result(stage).map(|r| &r.result)
    }

    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        self.warnings.push(StageNote {
            stage,
            message: message.into(),
        });
    }

    pub fn error(&mut self, stage: Stage, message: impl Into<String>) {
        self.errors.push(StageNote {
            stage,
            message: message.into(),
        });
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Summed token usage across stages.
    pub fn usage(&self) -> Usage {
        let mut total = Usage::default();
        for result in self.stage_results.values() {
            total.accumulate(&result.usage);
        }
        total
    }

    pub fn cost(&self) -> f64 {
        self.stage_results.values().map(|r| r.cost).sum()
    }

    /// Providers that served at least one stage, in stage order, deduplicated.
    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = Vec::new();
        for name in self.stage_results.values().filter_map(|r| r.provider.as_ref()) {
            if !providers.contains(name) {
                providers.push(name.clone());
            }
        }
        providers
    }

    /// Persistable summary of the invocation.
    pub fn metadata(&self) -> serde_json::Value {
        let stages: serde_json::Map<String, serde_json::Value> = self
            .stage_results
            .iter()
            .map(|(stage, r)| {
                (
                    stage.to_string(),
                    serde_json::json!({
                        "provider": r.provider,
                        "model": r.model,
                        "usage": r.usage,
                        "cost": r.cost,
                        "processing_time_ms": r.processing_time_ms,
                        "fallback": r.fallback,
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "context_id": self.id,
            "attempt": self.attempt,
            "started_at": self.started_at,
            "processing_time_ms": self.elapsed_ms(),
            "providers": self.providers(),
            "usage": self.usage(),
            "cost": self.cost(),
            "stages": stages,
            "warnings": self.warnings,
            "errors": self.errors,
        })
    }
}
