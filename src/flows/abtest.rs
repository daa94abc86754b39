use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{Instrument, info};

use super::{FlowOrchestrator, FlowReport, default_cutoff_year, require_success, to_params};
use crate::cohort::{CohortLabel, CohortPolicy, CohortStrategies};
use crate::context::{RunContext, RunIdentity};
use crate::error::FlowResult;
use crate::invocation::Invocation;
use crate::pipeline::StageSpec;
use crate::stages::DEFAULT_SEED;

pub const ABTEST_KEY: &str = "abtest-flow";

pub const ABTEST_ORDER: [&str; 8] = [
    "working_dir",
    "dataset_name",
    "flow_run_id_A",
    "flow_run_id_B",
    "hash_strategy",
    "split_strategy",
    "seed",
    "cutoff_year",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestParams {
    pub working_dir: PathBuf,
    pub dataset_name: String,
    #[serde(rename = "flow_run_id_A")]
    pub flow_run_id_a: RunIdentity,
    #[serde(rename = "flow_run_id_B")]
    pub flow_run_id_b: RunIdentity,
    #[serde(default)]
    pub hash_strategy: Option<Value>,
    #[serde(default)]
    pub split_strategy: Option<Value>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_cutoff_year")]
    pub cutoff_year: i32,
}

fn default_seed() -> u64 {
    DEFAULT_SEED
}

impl FlowOrchestrator {
    /// Evaluates the models of two earlier runs against cohorts A and B.
    pub async fn abtest(&self, invocation: &Invocation) -> FlowResult<FlowReport> {
        let params: AbTestParams = invocation.params(&ABTEST_ORDER)?;
        CohortPolicy::from_params(
            &CohortStrategies::default(),
            params.hash_strategy.as_ref(),
            params.split_strategy.as_ref(),
        )?;

        let run = RunContext::start("abtest", invocation.commit_id.clone());
        let span = tracing::info_span!("flow", flow = "abtest", run_id = %run.run_id);
        self.run_abtest(run, params).instrument(span).await
    }

    async fn run_abtest(&self, run: RunContext, params: AbTestParams) -> FlowResult<FlowReport> {
        info!(run_name = %run.run_name, "Starting A/B test flow");
        let model_a = self.upstream_model(&params.flow_run_id_a)?;
        let model_b = self.upstream_model(&params.flow_run_id_b)?;
        let dataset_path = params.working_dir.join(&params.dataset_name);

        let mut executor = self.executor(&run);
        let mut results = serde_json::Map::new();
        for (cohort, model) in [(CohortLabel::A, model_a), (CohortLabel::B, model_b)] {
            let spec = StageSpec::new("evaluate_cohort")
                .with_label(format!("evaluate_cohort_{cohort}"))
                .with_params(to_params(json!({
                    "dataset_path": dataset_path.display().to_string(),
                    "model": model,
                    "cohort": cohort,
                    "hash_strategy": params.hash_strategy,
                    "split_strategy": params.split_strategy,
                    "seed": params.seed,
                    "cutoff_year": params.cutoff_year,
                })));
            let scores = require_success(executor.run_stage(&spec).await)?;
            results.insert(format!("results_{cohort}"), scores);
        }

        let metadata = json!({
            "kwargs": params,
            "Results": results,
        });
        self.finish(&run, ABTEST_KEY, metadata, executor)
    }
}
