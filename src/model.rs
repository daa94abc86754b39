//! Fitted predictors.
//!
//! `fit(X, y)` returns a [`ModelHandle`] that serializes to JSON for the
//! registry and predicts one label per feature row.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Hyperparameters {
    NearestCentroid {
        #[serde(default = "default_standardize")]
        standardize: bool,
    },
    MajorityClass,
}

fn default_standardize() -> bool {
    true
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::NearestCentroid { standardize: true }
    }
}

impl Hyperparameters {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Could not find (or read) hyperparameter file at {}",
                path.display()
            )
        })?;
        serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse hyperparameter file: {}", path.display())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum ModelHandle {
    NearestCentroid {
        means: Vec<f64>,
        scales: Vec<f64>,
        centroids: BTreeMap<String, Vec<f64>>,
    },
    MajorityClass {
        label: String,
    },
}

impl ModelHandle {
    pub fn algorithm(&self) -> &'static str {
        match self {
            ModelHandle::NearestCentroid { .. } => "nearest_centroid",
            ModelHandle::MajorityClass { .. } => "majority_class",
        }
    }

    pub fn predict(&self, features: &[f64]) -> String {
        match self {
            ModelHandle::MajorityClass { label } => label.clone(),
            ModelHandle::NearestCentroid {
                means,
                scales,
                centroids,
            } => {
                let point: Vec<f64> = features
                    .iter()
                    .zip(means.iter().zip(scales.iter()))
                    .map(|(value, (mean, scale))| (value - mean) / scale)
                    .collect();
                let mut best: Option<(&String, f64)> = None;
                for (label, centroid) in centroids {
                    let distance: f64 = point
                        .iter()
                        .zip(centroid.iter())
                        .map(|(p, c)| (p - c) * (p - c))
                        .sum();
                    if best.is_none_or(|(_, d)| distance < d) {
                        best = Some((label, distance));
                    }
                }
                best.map(|(label, _)| label.clone()).unwrap_or_default()
            }
        }
    }
}

pub fn fit(params: &Hyperparameters, x: &[Vec<f64>], y: &[String]) -> Result<ModelHandle> {
    if x.is_empty() || x.len() != y.len() {
        bail!(
            "Cannot fit a model on {} feature rows and {} labels",
            x.len(),
            y.len()
        );
    }

    match params {
        Hyperparameters::MajorityClass => {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for label in y {
                *counts.entry(label.as_str()).or_default() += 1;
            }
            let label = counts
                .into_iter()
                .fold(None::<(&str, usize)>, |best, (label, count)| match best {
                    Some((_, best_count)) if best_count >= count => best,
                    _ => Some((label, count)),
                })
                .map(|(label, _)| label.to_string())
                .unwrap_or_default();
            Ok(ModelHandle::MajorityClass { label })
        }
        Hyperparameters::NearestCentroid { standardize } => {
            let width = x[0].len();
            let rows = x.len() as f64;
            let (means, scales) = if *standardize {
                let means: Vec<f64> = (0..width)
                    .map(|col| x.iter().map(|row| row[col]).sum::<f64>() / rows)
                    .collect();
                let scales: Vec<f64> = (0..width)
                    .map(|col| {
                        let variance = x
                            .iter()
                            .map(|row| (row[col] - means[col]).powi(2))
                            .sum::<f64>()
                            / rows;
                        let std = variance.sqrt();
                        if std > f64::EPSILON { std } else { 1.0 }
                    })
                    .collect();
                (means, scales)
            } else {
                (vec![0.0; width], vec![1.0; width])
            };

            let mut sums: BTreeMap<String, (Vec<f64>, usize)> = BTreeMap::new();
            for (row, label) in x.iter().zip(y) {
                let entry = sums
                    .entry(label.clone())
                    .or_insert_with(|| (vec![0.0; width], 0));
                for (col, value) in row.iter().enumerate().take(width) {
                    entry.0[col] += (value - means[col]) / scales[col];
                }
                entry.1 += 1;
            }
            let centroids = sums
                .into_iter()
                .map(|(label, (sum, count))| {
                    (label, sum.into_iter().map(|s| s / count as f64).collect())
                })
                .collect();

            Ok(ModelHandle::NearestCentroid {
                means,
                scales,
                centroids,
            })
        }
    }
}
