use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetRecord;
use crate::model::ModelHandle;

/// Multiclass classification scores over one evaluated group of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationScores {
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub f1: f64,
    pub groupsize: usize,
}

impl ClassificationScores {
    /// Scores used in place of a failed training run.
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Scores `y_pred` against `y_true`. Macro-F1 averages over the union of
/// observed and predicted labels; balanced accuracy averages recall over the
/// labels present in `y_true`. Empty input scores zero.
pub fn score<S: AsRef<str>>(y_true: &[S], y_pred: &[S]) -> ClassificationScores {
    let n = y_true.len().min(y_pred.len());
    if n == 0 {
        return ClassificationScores::zero();
    }

    #[derive(Default)]
    struct Counts {
        true_positive: usize,
        actual: usize,
        predicted: usize,
    }

    let mut per_label: BTreeMap<&str, Counts> = BTreeMap::new();
    let mut correct = 0usize;
    for (truth, pred) in y_true.iter().zip(y_pred.iter()).take(n) {
        let (truth, pred) = (truth.as_ref(), pred.as_ref());
        per_label.entry(truth).or_default().actual += 1;
        per_label.entry(pred).or_default().predicted += 1;
        if truth == pred {
            correct += 1;
            per_label.entry(truth).or_default().true_positive += 1;
        }
    }

    let mut recall_sum = 0.0;
    let mut recall_labels = 0usize;
    let mut f1_sum = 0.0;
    for counts in per_label.values() {
        if counts.actual > 0 {
            recall_sum += counts.true_positive as f64 / counts.actual as f64;
            recall_labels += 1;
        }
        let denominator = counts.actual + counts.predicted;
        if denominator > 0 {
            f1_sum += 2.0 * counts.true_positive as f64 / denominator as f64;
        }
    }

    ClassificationScores {
        accuracy: correct as f64 / n as f64,
        balanced_accuracy: if recall_labels == 0 {
            0.0
        } else {
            recall_sum / recall_labels as f64
        },
        f1: f1_sum / per_label.len() as f64,
        groupsize: n,
    }
}

/// Predicts every record with `model` and scores the predictions.
pub fn evaluate(model: &ModelHandle, records: &[&DatasetRecord]) -> ClassificationScores {
    let y_true: Vec<&str> = records.iter().map(|r| r.label.as_str()).collect();
    let predictions: Vec<String> = records
        .iter()
        .map(|r| model.predict(&r.feature_vector()))
        .collect();
    let y_pred: Vec<&str> = predictions.iter().map(String::as_str).collect();
    score(&y_true, &y_pred)
}

/// Distinct labels, sorted.
pub fn labels<'a>(records: impl IntoIterator<Item = &'a DatasetRecord>) -> BTreeSet<&'a str> {
    records.into_iter().map(|r| r.label.as_str()).collect()
}
