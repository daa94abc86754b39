use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Instrument, info};

use super::{FlowOrchestrator, FlowReport, default_cutoff_year, require_success, to_params};
use crate::context::RunContext;
use crate::error::{FlowError, FlowResult};
use crate::invocation::Invocation;
use crate::pipeline::StageSpec;
use crate::registry::ModelReference;

pub const MONITORING_KEY: &str = "monitoring_flow";

pub const MONITORING_ORDER: [&str; 8] = [
    "working_dir",
    "dataset_name",
    "model_name",
    "report_name",
    "model_version",
    "model_alias",
    "model_path",
    "cutoff_year",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringParams {
    pub working_dir: PathBuf,
    pub dataset_name: String,
    pub model_name: String,
    pub report_name: String,
    #[serde(default)]
    pub model_version: Option<Value>,
    #[serde(default)]
    pub model_alias: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default = "default_cutoff_year")]
    pub cutoff_year: i32,
}

impl MonitoringParams {
    /// Explicit path first, then alias, then version (`latest` when absent).
    pub fn model_reference(&self) -> FlowResult<ModelReference> {
        let version = match &self.model_version {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(raw.clone()),
            Some(other) => Some(other.to_string()),
        };
        ModelReference::select(
            &self.model_name,
            version.as_deref(),
            self.model_alias.as_deref(),
            self.model_path.as_deref(),
        )
        .map_err(|err| FlowError::Validation(format!("{err:#}")))
    }
}

impl FlowOrchestrator {
    /// Scores a model on reference and current partitions and reports drift.
    pub async fn monitor(&self, invocation: &Invocation) -> FlowResult<FlowReport> {
        let params: MonitoringParams = invocation.params(&MONITORING_ORDER)?;
        let reference = params.model_reference()?;
        let run = RunContext::start("monitoring", invocation.commit_id.clone());
        let span = tracing::info_span!("flow", flow = "monitoring", run_id = %run.run_id);
        self.run_monitoring(run, params, reference)
            .instrument(span)
            .await
    }

    async fn run_monitoring(
        &self,
        run: RunContext,
        params: MonitoringParams,
        reference: ModelReference,
    ) -> FlowResult<FlowReport> {
        info!(run_name = %run.run_name, model = %reference, "Starting monitoring flow");
        let mut executor = self.executor(&run);

        let spec = StageSpec::new("monitor_model").with_params(to_params(json!({
            "dataset_path": params.working_dir.join(&params.dataset_name).display().to_string(),
            "output_dir": params.working_dir.display().to_string(),
            "report_name": params.report_name,
            "model": reference.to_string(),
            "cutoff_year": params.cutoff_year,
        })));
        let result = require_success(executor.run_stage(&spec).await)?;

        let metadata = json!({
            "kwargs": params,
            "model_version": params.model_version,
            "model_alias": params.model_alias,
            "model_path_full": reference.to_string(),
            "metrics": result.get("metrics").cloned().unwrap_or(Value::Null),
        });
        self.finish(&run, MONITORING_KEY, metadata, executor)
    }
}
