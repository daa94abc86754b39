use serde::Serialize;

use crate::pipeline::StageRegistry;
use crate::settings::Settings;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_settings(settings: &Settings, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if settings.version != 1 {
        report
            .errors
            .push(format!("Unsupported settings version: {}", settings.version));
    }

    report.merge(validate_dataset(settings));
    report.merge(validate_training(settings));

    if settings.stages.default_timeout_secs == 0 {
        report
            .errors
            .push("stages.default_timeout_secs must be greater than zero".into());
    }
    if settings.stages.validation_timeout_secs == 0 {
        report
            .errors
            .push("stages.validation_timeout_secs must be greater than zero".into());
    }

    for required in [
        "data_quality",
        "train_model",
        "validate_model",
        "evaluate_cohort",
        "monitor_model",
    ] {
        if !registry.contains(required) {
            report
                .errors
                .push(format!("Stage '{required}' is not registered"));
        }
    }

    report
}

fn validate_dataset(settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::default();
    let dataset = &settings.dataset;

    if dataset.schema.partition_column.trim().is_empty() {
        report
            .errors
            .push("dataset.partition_column cannot be empty".into());
    }
    if dataset.schema.label_column.trim().is_empty() {
        report
            .errors
            .push("dataset.label_column cannot be empty".into());
    }
    if dataset.schema.feature_columns.is_empty() {
        report
            .errors
            .push("dataset.feature_columns must name at least one column".into());
    }
    if dataset
        .schema
        .feature_columns
        .iter()
        .any(|c| *c == dataset.schema.label_column || *c == dataset.schema.partition_column)
    {
        report.errors.push(
            "dataset.feature_columns cannot include the label or partition column".into(),
        );
    }
    if !dataset
        .schema
        .feature_columns
        .contains(&dataset.quantile_column)
    {
        report.errors.push(format!(
            "dataset.quantile_column '{}' is not a feature column",
            dataset.quantile_column
        ));
    }
    match &dataset.source {
        None => report
            .warnings
            .push("dataset.source is not set; the training flow cannot run".into()),
        Some(path) if !path.is_file() => report.warnings.push(format!(
            "dataset.source '{}' does not exist",
            path.display()
        )),
        Some(_) => {}
    }

    report
}

fn validate_training(settings: &Settings) -> ValidationReport {
    let mut report = ValidationReport::default();
    let training = &settings.training;

    if !(training.test_fraction > 0.0 && training.test_fraction < 1.0) {
        report.errors.push(format!(
            "training.test_fraction must be between 0 and 1, got {}",
            training.test_fraction
        ));
    }
    if training.backup_alias.trim().is_empty() {
        report
            .errors
            .push("training.backup_alias cannot be empty".into());
    }
    if training.min_train_rows == 0 {
        report
            .warnings
            .push("training.min_train_rows is zero; any training set is accepted".into());
    }
    if !training.hyperparameters.is_file() {
        report.warnings.push(format!(
            "training.hyperparameters '{}' does not exist; training will fail over to the backup model",
            training.hyperparameters.display()
        ));
    }

    report
}
