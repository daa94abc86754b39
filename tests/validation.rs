mod common;

use cohort_flow::pipeline::StageRegistry;
use cohort_flow::settings::Settings;
use cohort_flow::stages;
use cohort_flow::validation::validate_settings;
use tempfile::tempdir;

use common::{test_settings, write_hyperparameters, write_raw_dataset};

#[test]
fn defaults_only_warn_about_missing_inputs() {
    let report = validate_settings(&Settings::default(), &stages::default_registry());

    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    assert!(
        report.warnings.iter().any(|w| w.contains("dataset.source")),
        "warnings: {:?}",
        report.warnings
    );
    assert!(report.warnings.iter().any(|w| w.contains("backup model")));
}

#[test]
fn complete_settings_are_clean() {
    let temp = tempdir().unwrap();
    let mut settings = test_settings(temp.path());
    let source = temp.path().join("games.csv");
    write_raw_dataset(&source, 10, 30);
    settings.dataset.source = Some(source);
    write_hyperparameters(&settings);

    let report = validate_settings(&settings, &stages::default_registry());
    assert!(report.is_ok());
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
}

#[test]
fn out_of_range_values_are_errors() {
    let mut settings = Settings::default();
    settings.version = 2;
    settings.training.test_fraction = 1.5;
    settings.training.backup_alias = "  ".into();
    settings.stages.default_timeout_secs = 0;
    settings.stages.validation_timeout_secs = 0;

    let report = validate_settings(&settings, &stages::default_registry());
    assert!(!report.is_ok());
    for needle in [
        "settings version",
        "test_fraction",
        "backup_alias",
        "default_timeout_secs",
        "validation_timeout_secs",
    ] {
        assert!(
            report.errors.iter().any(|e| e.contains(needle)),
            "no error mentions {needle}: {:?}",
            report.errors
        );
    }
}

#[test]
fn schema_mistakes_are_errors() {
    let mut settings = Settings::default();
    settings.dataset.quantile_column = "revenue".into();
    settings
        .dataset
        .schema
        .feature_columns
        .push(settings.dataset.schema.label_column.clone());

    let report = validate_settings(&settings, &stages::default_registry());
    assert!(report.errors.iter().any(|e| e.contains("quantile_column 'revenue'")));
    assert!(report.errors.iter().any(|e| e.contains("label or partition")));
}

#[test]
fn flows_need_their_stages_registered() {
    let report = validate_settings(&Settings::default(), &StageRegistry::new());
    assert_eq!(
        report
            .errors
            .iter()
            .filter(|e| e.contains("is not registered"))
            .count(),
        5
    );
}

#[test]
fn settings_load_from_yaml() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("cohort-flow.yaml");
    std::fs::write(
        &path,
        "version: 1\ntraining:\n  min_train_rows: 10\n  backup_alias: Fallback\nstages:\n  default_retries: 2\n",
    )
    .unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.training.min_train_rows, 10);
    assert_eq!(settings.training.backup_alias, "Fallback");
    assert_eq!(settings.training.test_fraction, 0.2);
    assert_eq!(settings.stages.default_retries, 2);
    assert_eq!(settings.stages.validation_timeout_secs, 60);
    assert_eq!(settings.dataset.quantile_column, "price");

    assert!(Settings::load(&temp.path().join("missing.yaml")).is_err());
}
