use crate::stage::Stage;
use leadflow_core::LeadId;
use leadflow_providers::CallMetrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// What a running invocation is doing.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub context_id: Uuid,
    pub lead_id: LeadId,
    pub stage: Option<Stage>,
}

/// Aggregate counters across invocations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineCounters {
    pub completed: u64,
    pub failed: u64,
    /// Emails replaced by the fallback template.
    pub fallback_emails: u64,
    /// Invocations whose quality score fell below the threshold.
    pub low_quality: u64,
    /// Follow-up jobs that could not be enqueued.
    pub follow_up_failures: u64,
}

#[derive(Default)]
struct MonitorState {
    invocations: CallMetrics,
    stages: HashMap<Stage, CallMetrics>,
    active: HashMap<Uuid, ActiveRun>,
    counters: PipelineCounters,
}

/// Tracks running invocations plus per-invocation and per-stage metrics.
#[derive(Default)]
pub struct PipelineMonitor {
    state: Mutex<MonitorState>,
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, context_id: Uuid, lead_id: LeadId) {
        self.state.lock().active.insert(
            context_id,
            ActiveRun {
                context_id,
                lead_id,
                stage: None,
            },
        );
    }

    pub fn enter_stage(&self, context_id: Uuid, stage: Stage) {
        if let Some(run) = self.state.lock().active.get_mut(&context_id) {
            run.stage = Some(stage);
        }
    }

    pub fn record_stage_success(&self, stage: Stage, elapsed_ms: f64, cost: f64, tokens: u64) {
        self.state
            .lock()
            .stages
            .entry(stage)
            .or_default()
            .record_success(elapsed_ms, cost, tokens);
    }

    pub fn record_stage_failure(&self, stage: Stage, elapsed_ms: f64) {
        self.state
            .lock()
            .stages
            .entry(stage)
            .or_default()
            .record_failure(elapsed_ms);
    }

    pub fn record_fallback_email(&self) {
        self.state.lock().counters.fallback_emails += 1;
    }

    pub fn record_low_quality(&self) {
        self.state.lock().counters.low_quality += 1;
    }

    pub fn record_follow_up_failure(&self) {
        self.state.lock().counters.follow_up_failures += 1;
    }

    pub fn finish_success(&self, context_id: Uuid, elapsed_ms: f64, cost: f64, tokens: u64) {
        let mut state = self.state.lock();
        state.active.remove(&context_id);
        state.invocations.record_success(elapsed_ms, cost, tokens);
        state.counters.completed += 1;
    }

    pub fn finish_failure(&self, context_id: Uuid, elapsed_ms: f64) {
        let mut state = self.state.lock();
        state.active.remove(&context_id);
        state.invocations.record_failure(elapsed_ms);
        state.counters.failed += 1;
    }

    /// Count an invocation that failed before it was tracked as active.
    pub fn record_rejected(&self, elapsed_ms: f64) {
        let mut state = self.state.lock();
        state.invocations.record_failure(elapsed_ms);
        state.counters.failed += 1;
    }

    pub fn invocations(&self) -> CallMetrics {
        self.state.lock().invocations.clone()
    }

    pub fn stage(&self, stage: Stage) -> Option<CallMetrics> {
        self.state.lock().stages.get(&stage).cloned()
    }

    pub fn counters(&self) -> PipelineCounters {
        self.state.lock().counters.clone()
    }

    pub fn active(&self) -> Vec<ActiveRun> {
        self.state.lock().active.values().cloned().collect()
    }

    /// Serialize the current state as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let state = self.state.lock();
        let stages: serde_json::Map<String, serde_json::Value> = Stage::ALL
            .iter()
            .filter_map(|stage| {
                state.stages.get(stage).map(|m| {
                    (
                        stage.to_string(),
                        serde_json::to_value(m).unwrap_or(serde_json::Value::Null),
                    )
                })
            })
            .collect();
        serde_json::json!({
            "invocations": state.invocations,
            "stages": stages,
            "counters": state.counters,
            "active": state.active.values().collect::<Vec<_>>(),
        })
    }
}
