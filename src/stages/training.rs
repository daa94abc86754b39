use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    load_dataset, require_path, require_string, scores_json, take_f64, take_string, take_year,
};
use crate::model::{self, Hyperparameters};
use crate::pipeline::{Stage, StageContext, StageParameters};
use crate::registry::ModelReference;
use crate::scoring::{self, labels};

pub const VALIDATION_REPORT: &str = "classifier_results.json";

/// Fits a model on the partitions before the cutoff year and registers it.
pub struct TrainModelStage {
    dataset_path: PathBuf,
    model_name: String,
    cutoff_year: i32,
    hyperparameters: Option<PathBuf>,
}

impl TrainModelStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        Ok(Self {
            dataset_path: require_path(&mut params, "train_model", "dataset_path")?,
            model_name: require_string(&mut params, "train_model", "model_name")?,
            cutoff_year: take_year(&mut params, "cutoff_year")?,
            hyperparameters: take_string(&mut params, "hyperparameters").map(PathBuf::from),
        })
    }
}

impl Stage for TrainModelStage {
    fn name(&self) -> &'static str {
        "train_model"
    }

    fn run(&self, ctx: &StageContext) -> Result<Value> {
        let training = &ctx.settings.training;
        let dataset = load_dataset(ctx, &self.dataset_path)?;

        let mut rows = dataset.before_year(self.cutoff_year);
        rows.shuffle(&mut StdRng::seed_from_u64(training.split_seed));
        let test_len = (rows.len() as f64 * training.test_fraction).ceil() as usize;
        let (test, train) = rows.split_at(test_len.min(rows.len()));
        if train.len() < training.min_train_rows {
            bail!(
                "Training set is too small: {} rows, at least {} required",
                train.len(),
                training.min_train_rows
            );
        }

        let hyperparameters_path = self
            .hyperparameters
            .as_ref()
            .unwrap_or(&training.hyperparameters);
        let hyperparameters = Hyperparameters::load(hyperparameters_path)?;

        let x: Vec<Vec<f64>> = train.iter().map(|r| r.feature_vector()).collect();
        let y: Vec<String> = train.iter().map(|r| r.label.clone()).collect();
        debug!(
            rows = train.len(),
            classes = labels(train.iter().copied()).len(),
            "Fitting model"
        );
        let fitted = model::fit(&hyperparameters, &x, &y)?;
        let metrics = scoring::evaluate(&fitted, test);

        let version = ctx.settings.model_registry().register(
            &self.model_name,
            &fitted,
            &hyperparameters,
            &metrics,
        )?;
        let reference = ModelReference::version(&self.model_name, version);
        info!(
            model = %reference,
            accuracy = metrics.accuracy,
            f1 = metrics.f1,
            "Model trained"
        );

        Ok(json!({
            "model_name": self.model_name,
            "model_version": version,
            "model_path_full": reference.to_string(),
            "metrics": metrics,
        }))
    }
}

/// Scores a registered model on the current partitions against fixed thresholds.
pub struct ValidateModelStage {
    dataset_path: PathBuf,
    output_dir: PathBuf,
    reference: ModelReference,
    cutoff_year: i32,
    acc_threshold: f64,
    f1_threshold: f64,
}

impl ValidateModelStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        let model_name = require_string(&mut params, "validate_model", "model_name")?;
        let version = take_string(&mut params, "model_version");
        let alias = take_string(&mut params, "model_alias");
        Ok(Self {
            dataset_path: require_path(&mut params, "validate_model", "dataset_path")?,
            output_dir: require_path(&mut params, "validate_model", "output_dir")?,
            reference: ModelReference::select(
                &model_name,
                version.as_deref(),
                alias.as_deref(),
                None,
            )?,
            cutoff_year: take_year(&mut params, "cutoff_year")?,
            acc_threshold: take_f64(&mut params, "acc_threshold").unwrap_or(0.0),
            f1_threshold: take_f64(&mut params, "f1_threshold").unwrap_or(0.0),
        })
    }
}

impl Stage for ValidateModelStage {
    fn name(&self) -> &'static str {
        "validate_model"
    }

    fn run(&self, ctx: &StageContext) -> Result<Value> {
        let dataset = load_dataset(ctx, &self.dataset_path)?;
        let current = dataset.from_year(self.cutoff_year);
        let fitted = ctx.settings.model_registry().resolve(&self.reference)?;
        let scores = scoring::evaluate(&fitted, &current);

        let passed = scores.accuracy >= self.acc_threshold && scores.f1 >= self.f1_threshold;
        let report = json!({
            "model": self.reference.to_string(),
            "cutoff_year": self.cutoff_year,
            "thresholds": { "accuracy": self.acc_threshold, "f1": self.f1_threshold },
            "scores": scores,
            "passed": passed,
        });
        fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("Failed to create directory: {}", self.output_dir.display())
        })?;
        let report_path = self.output_dir.join(VALIDATION_REPORT);
        let body = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        fs::write(&report_path, body)
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;

        info!(
            model = %self.reference,
            accuracy = scores.accuracy,
            balanced_accuracy = scores.balanced_accuracy,
            f1 = scores.f1,
            passed,
            "Model validated"
        );
        if !passed {
            bail!(
                "Model {} is below threshold: accuracy {:.4} (min {:.4}), f1 {:.4} (min {:.4})",
                self.reference,
                scores.accuracy,
                self.acc_threshold,
                scores.f1,
                self.f1_threshold
            );
        }

        Ok(scores_json(&scores, &self.reference.to_string()))
    }
}
