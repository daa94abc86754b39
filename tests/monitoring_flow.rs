mod common;

use std::sync::Arc;

use cohort_flow::artifact::ArtifactExchange;
use cohort_flow::error::FlowError;
use cohort_flow::flows::{FlowOrchestrator, MONITORING_KEY, MonitoringParams};
use cohort_flow::invocation::Invocation;
use cohort_flow::model::{Hyperparameters, ModelHandle};
use cohort_flow::registry::ModelReference;
use cohort_flow::scoring::ClassificationScores;
use cohort_flow::stages;
use serde_json::{Value, json};
use tempfile::tempdir;

use common::{LOW, test_settings, write_normalized_dataset};

#[tokio::test]
async fn monitoring_reports_reference_and_current_scores() {
    let temp = tempdir().unwrap();
    let settings = test_settings(temp.path());
    let working_dir = temp.path().join("data");
    std::fs::create_dir_all(&working_dir).unwrap();
    write_normalized_dataset(&working_dir.join("games.csv"), 400, 7);

    let registry = settings.model_registry();
    let version = registry
        .register(
            "forest",
            &ModelHandle::MajorityClass { label: LOW.into() },
            &Hyperparameters::MajorityClass,
            &ClassificationScores::zero(),
        )
        .unwrap();
    registry.set_alias("forest", "Champion", version).unwrap();

    let orchestrator = FlowOrchestrator::new(
        Arc::new(settings),
        Arc::new(stages::default_registry()),
        ArtifactExchange::in_memory(),
    );
    let invocation = Invocation::parse(
        &json!({
            "args": [working_dir.display().to_string(), "games.csv", "forest", "drift.json"],
            "kwargs": { "model_alias": "Champion", "model_version": 7 },
        })
        .to_string(),
    );
    let report = orchestrator.monitor(&invocation).await.unwrap();

    let metadata = &report.metadata;
    assert_eq!(metadata["model_path_full"], json!("registry:/forest@Champion"));
    assert_eq!(metadata["model_alias"], json!("Champion"));
    assert_eq!(metadata["git_commit_hexsha"], Value::Null);
    assert!(metadata["metrics"]["reference"]["groupsize"].as_u64().unwrap() > 0);
    assert!(metadata["metrics"]["current"]["groupsize"].as_u64().unwrap() > 0);

    let written: Value =
        serde_json::from_str(&std::fs::read_to_string(working_dir.join("drift.json")).unwrap())
            .unwrap();
    let shift = &written["feature_drift"]["positive_reviews"];
    assert!(shift["reference_mean"].as_f64().is_some());
    assert!(shift["mean_shift"].as_f64().is_some());

    let fetched = orchestrator.exchange().fetch(&report.run_id).unwrap();
    assert_eq!(&fetched, metadata);
    assert_eq!(MONITORING_KEY, "monitoring_flow");

    let snapshot = orchestrator.metrics().snapshot();
    let stage_ms: f64 = snapshot.stages.values().map(|m| m.total_duration_ms).sum();
    assert!(snapshot.total_duration_ms > 0.0);
    assert!(snapshot.total_duration_ms >= stage_ms);
}

#[test]
fn model_precedence_is_path_then_alias_then_version() {
    let mut params: MonitoringParams = serde_json::from_value(json!({
        "working_dir": ".",
        "dataset_name": "games.csv",
        "model_name": "forest",
        "report_name": "drift.json",
        "model_version": "3",
        "model_alias": "Backup",
        "model_path": "registry:/other/2",
    }))
    .unwrap();
    assert_eq!(
        params.model_reference().unwrap(),
        ModelReference::version("other", 2)
    );

    params.model_path = None;
    assert_eq!(
        params.model_reference().unwrap(),
        ModelReference::alias("forest", "Backup")
    );

    params.model_alias = None;
    assert_eq!(params.model_reference().unwrap(), ModelReference::version("forest", 3));

    params.model_version = Some(json!(4));
    assert_eq!(params.model_reference().unwrap(), ModelReference::version("forest", 4));

    params.model_version = None;
    assert_eq!(params.model_reference().unwrap(), ModelReference::latest("forest"));

    params.model_version = Some(json!("newest"));
    assert!(matches!(params.model_reference(), Err(FlowError::Validation(_))));
}
