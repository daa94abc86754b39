use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::info;

use super::{require_path, require_string, take_string, take_year};
use crate::dataset::{Dataset, DatasetRecord};
use crate::pipeline::{Stage, StageContext, StageParameters};

const QUANTILES: [f64; 5] = [0.1, 0.3, 0.5, 0.7, 0.9];

/// Normalizes the raw dataset and writes a data-quality report next to it.
pub struct DataQualityStage {
    output_dir: PathBuf,
    outfile_name: String,
    report_name: String,
    source: Option<PathBuf>,
    cutoff_year: i32,
}

impl DataQualityStage {
    pub fn from_params(mut params: StageParameters) -> Result<Self> {
        Ok(Self {
            output_dir: require_path(&mut params, "data_quality", "output_dir")?,
            outfile_name: require_string(&mut params, "data_quality", "outfile_name")?,
            report_name: require_string(&mut params, "data_quality", "report_name")?,
            source: take_string(&mut params, "source").map(PathBuf::from),
            cutoff_year: take_year(&mut params, "cutoff_year")?,
        })
    }
}

impl Stage for DataQualityStage {
    fn name(&self) -> &'static str {
        "data_quality"
    }

    fn run(&self, ctx: &StageContext) -> Result<Value> {
        let settings = &ctx.settings.dataset;
        let source = self
            .source
            .as_ref()
            .or(settings.source.as_ref())
            .ok_or_else(|| anyhow!("No dataset source configured (dataset.source)"))?;

        let dataset = Dataset::load_with_renames(source, &settings.schema, &settings.renames)?;
        let dataset_path = self.output_dir.join(&self.outfile_name);
        dataset.write_csv(&dataset_path)?;

        let quantile_idx = dataset.feature_index(&settings.quantile_column).ok_or_else(|| {
            anyhow!(
                "Quantile column '{}' is not a feature column",
                settings.quantile_column
            )
        })?;
        let reference = dataset.before_year(self.cutoff_year);
        let current = dataset.from_year(self.cutoff_year);

        let report = json!({
            "source": source.display().to_string(),
            "rows": dataset.len(),
            "cutoff_year": self.cutoff_year,
            "reference_rows": reference.len(),
            "current_rows": current.len(),
            "missing_values": dataset.missing_counts(),
            "quantile_column": settings.quantile_column,
            "quantiles": {
                "reference": quantile_summary(&reference, quantile_idx),
                "current": quantile_summary(&current, quantile_idx),
            },
        });
        let report_path = self.output_dir.join(&self.report_name);
        let body = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        fs::write(&report_path, body)
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;

        info!(
            dataset = %dataset_path.display(),
            report = %report_path.display(),
            rows = dataset.len(),
            "Data quality report written"
        );
        Ok(json!({
            "dataset_path": dataset_path.display().to_string(),
            "report_path": report_path.display().to_string(),
            "rows": dataset.len(),
            "reference_rows": reference.len(),
            "current_rows": current.len(),
        }))
    }
}

fn quantile_summary(records: &[&DatasetRecord], feature_idx: usize) -> Value {
    let mut values: Vec<f64> = records
        .iter()
        .filter_map(|r| r.features.get(feature_idx).copied().flatten())
        .collect();
    values.sort_by(f64::total_cmp);

    let mut summary = serde_json::Map::new();
    for q in QUANTILES {
        summary.insert(format!("{q}"), json!(quantile(&values, q)));
    }
    Value::Object(summary)
}

/// Linear-interpolated quantile of sorted `values`; `None` when empty.
fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let position = q * (values.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * weight)
}
