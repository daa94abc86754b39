use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::dataset::Dataset;
use crate::pipeline::{StageContext, StageParameters, StageRegistry};
use crate::scoring::ClassificationScores;

mod evaluation;
mod quality;
mod training;

pub use evaluation::{DEFAULT_SEED, EvaluateCohortStage, MonitorModelStage};
pub use quality::DataQualityStage;
pub use training::{TrainModelStage, ValidateModelStage};

pub const DEFAULT_CUTOFF_YEAR: i32 = 2020;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("data_quality", |params| {
        Ok(Box::new(DataQualityStage::from_params(params)?))
    });
    registry.register("train_model", |params| {
        Ok(Box::new(TrainModelStage::from_params(params)?))
    });
    registry.register("validate_model", |params| {
        Ok(Box::new(ValidateModelStage::from_params(params)?))
    });
    registry.register("evaluate_cohort", |params| {
        Ok(Box::new(EvaluateCohortStage::from_params(params)?))
    });
    registry.register("monitor_model", |params| {
        Ok(Box::new(MonitorModelStage::from_params(params)?))
    });
}

/// Registry with every built-in stage.
pub fn default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    registry
}

fn load_dataset(ctx: &StageContext, path: &Path) -> Result<Dataset> {
    Dataset::load(path, &ctx.settings.dataset.schema)
}

fn scores_json(scores: &ClassificationScores, model: &str) -> Value {
    json!({
        "accuracy": scores.accuracy,
        "balanced_accuracy": scores.balanced_accuracy,
        "f1": scores.f1,
        "groupsize": scores.groupsize,
        "model": model,
    })
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn require_string(params: &mut StageParameters, stage: &str, key: &str) -> Result<String> {
    take_string(params, key).ok_or_else(|| anyhow!("{stage} stage requires '{key}' parameter"))
}

fn require_path(params: &mut StageParameters, stage: &str, key: &str) -> Result<PathBuf> {
    require_string(params, stage, key).map(PathBuf::from)
}

fn take_u64(params: &mut StageParameters, key: &str) -> Option<u64> {
    params.remove(key).and_then(|value| match value {
        Value::Number(num) => num.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

fn take_year(params: &mut StageParameters, key: &str) -> Result<i32> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(DEFAULT_CUTOFF_YEAR),
        Some(Value::Number(num)) => num
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| anyhow!("'{key}' must be a year, got {num}")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| anyhow!("'{key}' must be a year, got '{s}'")),
        Some(other) => Err(anyhow!("'{key}' must be a year, got {other}")),
    }
}

fn take_f64(params: &mut StageParameters, key: &str) -> Option<f64> {
    params.remove(key).and_then(|value| match value {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_every_builtin_stage() {
        let registry = default_registry();
        assert_eq!(
            registry.known_stages(),
            vec![
                "data_quality",
                "evaluate_cohort",
                "monitor_model",
                "train_model",
                "validate_model"
            ]
        );
    }

    #[test]
    fn year_parameter_accepts_numbers_and_strings() {
        let mut params = StageParameters::new();
        params.insert("cutoff_year".into(), json!("2019"));
        assert_eq!(take_year(&mut params, "cutoff_year").unwrap(), 2019);
        params.insert("cutoff_year".into(), json!(2021));
        assert_eq!(take_year(&mut params, "cutoff_year").unwrap(), 2021);
        assert_eq!(take_year(&mut params, "cutoff_year").unwrap(), DEFAULT_CUTOFF_YEAR);
        params.insert("cutoff_year".into(), json!([1]));
        assert!(take_year(&mut params, "cutoff_year").is_err());
    }
}
