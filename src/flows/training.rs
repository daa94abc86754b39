use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Instrument, info, warn};

use super::{FlowOrchestrator, FlowReport, default_cutoff_year, require_success, to_params};
use crate::context::RunContext;
use crate::error::FlowResult;
use crate::invocation::Invocation;
use crate::pipeline::{StageOutcome, StageSpec};
use crate::registry::ModelReference;
use crate::scoring::ClassificationScores;

pub const TRAINING_KEY: &str = "training_flow";

pub const TRAINING_ORDER: [&str; 5] = [
    "output_dir",
    "outfile_name",
    "report_name",
    "model_name",
    "cutoff_year",
];

/// Validation thresholds are this fraction of the training scores. A failed
/// training run scores zero, so its thresholds are zero as well.
pub const VALIDATION_THRESHOLD_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingParams {
    pub output_dir: PathBuf,
    pub outfile_name: String,
    pub report_name: String,
    pub model_name: String,
    #[serde(default = "default_cutoff_year")]
    pub cutoff_year: i32,
}

/// Model the validation stage checks, and what the run reports about it.
struct Candidate {
    selector: (&'static str, Value),
    training_scores: ClassificationScores,
    trained: bool,
    model_path_full: Option<String>,
}

impl FlowOrchestrator {
    /// Data quality, training and validation; falls back to the backup model
    /// when training fails.
    pub async fn train(&self, invocation: &Invocation) -> FlowResult<FlowReport> {
        let params: TrainingParams = invocation.params(&TRAINING_ORDER)?;
        let run = RunContext::start("training", invocation.commit_id.clone());
        let span = tracing::info_span!("flow", flow = "training", run_id = %run.run_id);
        self.run_training(run, params).instrument(span).await
    }

    async fn run_training(
        &self,
        run: RunContext,
        params: TrainingParams,
    ) -> FlowResult<FlowReport> {
        info!(run_name = %run.run_name, "Starting training flow");
        let mut executor = self.executor(&run);
        let dataset_path = params.output_dir.join(&params.outfile_name);

        let quality = StageSpec::new("data_quality").with_params(to_params(json!({
            "output_dir": params.output_dir.display().to_string(),
            "outfile_name": params.outfile_name,
            "report_name": params.report_name,
            "cutoff_year": params.cutoff_year,
        })));
        require_success(executor.run_stage(&quality).await)?;

        let train = StageSpec::new("train_model").with_params(to_params(json!({
            "dataset_path": dataset_path.display().to_string(),
            "model_name": params.model_name,
            "cutoff_year": params.cutoff_year,
        })));
        let candidate = match &executor.run_stage(&train).await.outcome {
            StageOutcome::Succeeded(value) => {
                let version = value.get("model_version").cloned().unwrap_or(Value::Null);
                let training_scores = value
                    .get("metrics")
                    .cloned()
                    .and_then(|m| serde_json::from_value(m).ok())
                    .unwrap_or_default();
                let model_path_full = version
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .map(|v| ModelReference::version(&params.model_name, v).to_string());
                Candidate {
                    selector: ("model_version", version),
                    training_scores,
                    trained: true,
                    model_path_full,
                }
            }
            StageOutcome::Failed(failure) => {
                let backup = &self.settings.training.backup_alias;
                warn!(
                    reason = %failure.reason,
                    message = %failure.message,
                    fallback = %ModelReference::alias(&params.model_name, backup),
                    "Training failed, validating the backup model instead"
                );
                Candidate {
                    selector: ("model_alias", json!(backup)),
                    training_scores: ClassificationScores::zero(),
                    trained: false,
                    model_path_full: None,
                }
            }
        };

        let mut validation_params = to_params(json!({
            "dataset_path": dataset_path.display().to_string(),
            "output_dir": params.output_dir.display().to_string(),
            "model_name": params.model_name,
            "cutoff_year": params.cutoff_year,
            "acc_threshold": VALIDATION_THRESHOLD_FACTOR * candidate.training_scores.accuracy,
            "f1_threshold": VALIDATION_THRESHOLD_FACTOR * candidate.training_scores.f1,
        }));
        let (key, value) = candidate.selector;
        validation_params.insert(key.to_string(), value);
        let validate = StageSpec::new("validate_model")
            .with_params(validation_params)
            .with_retries(0)
            .with_timeout(Duration::from_secs(
                self.settings.stages.validation_timeout_secs,
            ));
        let validation = require_success(executor.run_stage(&validate).await)?;

        let metric = |name: &str| validation.get(name).cloned().unwrap_or(json!(0.0));
        let metadata = json!({
            "kwargs": params,
            "metrics": {
                "accuracy": metric("accuracy"),
                "balanced_accuracy": metric("balanced_accuracy"),
                "f1-score": metric("f1"),
            },
            "model_training_successful": candidate.trained,
            "model_path_full": candidate.model_path_full,
        });
        self.finish(&run, TRAINING_KEY, metadata, executor)
    }
}
