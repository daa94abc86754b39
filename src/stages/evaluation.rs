use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use tracing::info;

use super::{load_dataset, require_path, require_string, scores_json, take_u64, take_year};
use crate::cohort::{CohortAssigner, CohortLabel, CohortPolicy, CohortStrategies};
use crate::dataset::DatasetRecord;
use crate::pipeline::{Stage, StageContext, StageParameters};
use crate::registry::ModelReference;
use crate::scoring;

pub const DEFAULT_SEED: u64 = 42;

/// Scores one model against one cohort of the dataset.
pub struct EvaluateCohortStage {
    dataset_path: PathBuf,
    reference: ModelReference,
    cohort: CohortLabel,
    assigner: CohortAssigner,
}

impl EvaluateCohortStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let cohort = params
            .remove("cohort")
            .ok_or_else(|| anyhow!("evaluate_cohort stage requires 'cohort' parameter"))?;
        let cohort: CohortLabel = serde_json::from_value(cohort)
            .context("'cohort' must be one of \"A\", \"Neutral\", \"B\"")?;
        let policy = CohortPolicy::from_params(
            &CohortStrategies::default(),
            params.get("hash_strategy"),
            params.get("split_strategy"),
        )?;
        let seed = take_u64(&mut params, "seed").unwrap_or(DEFAULT_SEED);
        let cutoff_year = take_year(&mut params, "cutoff_year")?;

        Ok(Self {
            dataset_path: require_path(&mut params, "evaluate_cohort", "dataset_path")?,
            reference: require_string(&mut params, "evaluate_cohort", "model")?.parse()?,
            cohort,
            assigner: CohortAssigner::new(policy, seed, cutoff_year),
        })
    }
}

impl Stage for EvaluateCohortStage {
    fn name(&self) -> &'static str {
        "evaluate_cohort"
    }

    fn run(&self, ctx: &StageContext) -> Result<Value> {
        let dataset = load_dataset(ctx, &self.dataset_path)?;
        let assignment = self.assigner.assign(dataset.records());
        let members = assignment.cohort(self.cohort);

        let fitted = ctx.settings.model_registry().resolve(&self.reference)?;
        let scores = scoring::evaluate(&fitted, members);
        info!(
            cohort = %self.cohort,
            model = %self.reference,
            groupsize = scores.groupsize,
            accuracy = scores.accuracy,
            "Cohort evaluated"
        );
        Ok(scores_json(&scores, &self.reference.to_string()))
    }
}

/// Compares a model's scores and the feature means between the reference
/// (before cutoff) and current partitions.
pub struct MonitorModelStage {
    dataset_path: PathBuf,
    output_dir: PathBuf,
    report_name: String,
    reference: ModelReference,
    cutoff_year: i32,
}

impl MonitorModelStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        Ok(Self {
            dataset_path: require_path(&mut params, "monitor_model", "dataset_path")?,
            output_dir: require_path(&mut params, "monitor_model", "output_dir")?,
            report_name: require_string(&mut params, "monitor_model", "report_name")?,
            reference: require_string(&mut params, "monitor_model", "model")?.parse()?,
            cutoff_year: take_year(&mut params, "cutoff_year")?,
        })
    }
}

impl Stage for MonitorModelStage {
    fn name(&self) -> &'static str {
        "monitor_model"
    }

    fn run(&self, ctx: &StageContext) -> Result<Value> {
        let dataset = load_dataset(ctx, &self.dataset_path)?;
        let reference = dataset.before_year(self.cutoff_year);
        let current = dataset.from_year(self.cutoff_year);

        let fitted = ctx.settings.model_registry().resolve(&self.reference)?;
        let reference_scores = scoring::evaluate(&fitted, &reference);
        let current_scores = scoring::evaluate(&fitted, &current);

        let mut drift = Map::new();
        for (idx, column) in dataset.schema().feature_columns.iter().enumerate() {
            let before = feature_mean(&reference, idx);
            let after = feature_mean(&current, idx);
            let shift = before.zip(after).map(|(b, a)| a - b);
            drift.insert(
                column.clone(),
                json!({ "reference_mean": before, "current_mean": after, "mean_shift": shift }),
            );
        }

        let metrics = json!({
            "reference": reference_scores,
            "current": current_scores,
        });
        let report = json!({
            "model": self.reference.to_string(),
            "cutoff_year": self.cutoff_year,
            "metrics": metrics,
            "feature_drift": drift,
        });
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create directory: {}", self.output_dir.display())
        })?;
        let report_path = self.output_dir.join(&self.report_name);
        let body = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        fs::write(&report_path, body)
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;

        info!(
            model = %self.reference,
            report = %report_path.display(),
            reference_accuracy = reference_scores.accuracy,
            current_accuracy = current_scores.accuracy,
            "Monitoring report written"
        );
        Ok(json!({
            "model": self.reference.to_string(),
            "report_path": report_path.display().to_string(),
            "metrics": metrics,
        }))
    }
}

fn feature_mean(records: &[&DatasetRecord], idx: usize) -> Option<f64> {
    let values: Vec<f64> = records
        .iter()
        .filter_map(|r| r.features.get(idx).copied().flatten())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_cohort_and_strategy() {
        let mut params = StageParameters::new();
        params.insert("dataset_path".into(), json!("games.csv"));
        params.insert("model".into(), json!("registry:/forest/1"));
        params.insert("cohort".into(), json!("C"));
        assert!(EvaluateCohortStage::from_params(params.clone()).is_err());

        params.insert("cohort".into(), json!("A"));
        params.insert("hash_strategy".into(), json!("md5"));
        assert!(EvaluateCohortStage::from_params(params.clone()).is_err());

        params.insert("hash_strategy".into(), Value::Null);
        assert!(EvaluateCohortStage::from_params(params).is_ok());
    }
}
