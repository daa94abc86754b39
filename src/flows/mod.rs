//! Flow orchestration.
//!
//! A flow owns one [`RunContext`], drives a [`PipelineExecutor`] stage by
//! stage, decides what a failed [`StageOutcome`] means for the run, and
//! publishes a single metadata document under the run's identity.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::artifact::ArtifactExchange;
use crate::context::{RunContext, RunIdentity};
use crate::error::{ArtifactError, FlowError, FlowResult};
use crate::observability::MetricsCollector;
use crate::pipeline::{PipelineExecutor, StageOutcome, StageRecord, StageRegistry};
use crate::settings::Settings;
use crate::stages;

mod abtest;
mod monitoring;
mod training;

pub use abtest::{ABTEST_KEY, ABTEST_ORDER, AbTestParams};
pub use monitoring::{MONITORING_KEY, MONITORING_ORDER, MonitoringParams};
pub use training::{TRAINING_KEY, TRAINING_ORDER, TrainingParams, VALIDATION_THRESHOLD_FACTOR};

const ARTIFACT_DESCRIPTION: &str = "Flow metadata serialized as JSON";

fn default_cutoff_year() -> i32 {
    stages::DEFAULT_CUTOFF_YEAR
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct FlowReport {
    pub run_id: RunIdentity,
    pub artifact_id: String,
    pub metadata: Value,
    pub stages: Vec<StageRecord>,
}

impl FlowReport {
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.name == name)
    }
}

pub struct FlowOrchestrator {
    settings: Arc<Settings>,
    stages: Arc<StageRegistry>,
    exchange: ArtifactExchange,
    metrics: MetricsCollector,
}

impl FlowOrchestrator {
    pub fn new(
        settings: Arc<Settings>,
        stages: Arc<StageRegistry>,
        exchange: ArtifactExchange,
    ) -> Self {
        Self {
            settings,
            stages,
            exchange,
            metrics: MetricsCollector::new(),
        }
    }

    /// Orchestrator over the built-in stages and the configured stores.
    pub fn from_settings(settings: Settings) -> Self {
        let exchange = settings.exchange();
        Self::new(
            Arc::new(settings),
            Arc::new(stages::default_registry()),
            exchange,
        )
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn exchange(&self) -> &ArtifactExchange {
        &self.exchange
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    fn executor(&self, run: &RunContext) -> PipelineExecutor {
        PipelineExecutor::new(self.stages.clone(), run.clone(), self.settings.clone())
            .with_metrics(self.metrics.clone())
    }

    /// Reads the model reference an upstream run published.
    fn upstream_model(&self, run_id: &RunIdentity) -> FlowResult<String> {
        let payload = self.exchange.fetch(run_id)?;
        match payload.get("model_path_full") {
            Some(Value::String(path)) if !path.trim().is_empty() => Ok(path.clone()),
            _ => Err(ArtifactError::Corrupt {
                run_id: run_id.to_string(),
                reason: "payload has no model_path_full".to_string(),
            }
            .into()),
        }
    }

    /// Publishes the run's metadata document and closes the run.
    fn finish(
        &self,
        run: &RunContext,
        key: &str,
        mut metadata: Value,
        executor: PipelineExecutor,
    ) -> FlowResult<FlowReport> {
        if let Some(doc) = metadata.as_object_mut() {
            doc.insert("flow_run_id".into(), json!(run.run_id));
            doc.insert("git_commit_hexsha".into(), json!(run.commit_id));
            doc.insert("timestamp_start".into(), json!(run.started_at.to_rfc3339()));
            doc.insert("timestamp_end".into(), json!(Utc::now().to_rfc3339()));
        }

        let artifact_id = self
            .exchange
            .publish(&run.run_id, key, &metadata, ARTIFACT_DESCRIPTION)?;
        self.exchange.record_run(&run.run_id);
        let elapsed = (Utc::now() - run.started_at).to_std().unwrap_or_default();
        self.metrics.record_total_duration(elapsed);
        info!(
            run_id = %run.run_id,
            artifact_id = %artifact_id,
            duration_ms = elapsed.as_millis() as u64,
            "Flow finished"
        );

        Ok(FlowReport {
            run_id: run.run_id.clone(),
            artifact_id,
            metadata,
            stages: executor.into_records(),
        })
    }
}

/// Value of a succeeded stage; a failed stage aborts the run.
fn require_success(record: &StageRecord) -> FlowResult<Value> {
    match &record.outcome {
        StageOutcome::Succeeded(value) => Ok(value.clone()),
        StageOutcome::Failed(failure) => {
            error!(stage = %record.name, reason = %failure.reason, "Stage failed, aborting run");
            Err(FlowError::StageAborted {
                stage: record.name.clone(),
                reason: failure.to_string(),
            })
        }
    }
}

fn to_params(value: Value) -> crate::pipeline::StageParameters {
    match value {
        Value::Object(map) => map,
        _ => crate::pipeline::StageParameters::new(),
    }
}
