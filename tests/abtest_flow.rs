mod common;

use std::sync::Arc;

use cohort_flow::artifact::ArtifactExchange;
use cohort_flow::context::RunIdentity;
use cohort_flow::error::{ArtifactError, FlowError};
use cohort_flow::flows::{ABTEST_KEY, FlowOrchestrator};
use cohort_flow::invocation::Invocation;
use cohort_flow::model::{Hyperparameters, ModelHandle};
use cohort_flow::scoring::ClassificationScores;
use cohort_flow::settings::Settings;
use cohort_flow::stages;
use serde_json::{Value, json};
use tempfile::tempdir;

use common::{HIGH, LOW, test_settings, write_normalized_dataset};

struct Fixture {
    _temp: tempfile::TempDir,
    working_dir: std::path::PathBuf,
    orchestrator: FlowOrchestrator,
}

/// Two upstream runs: one publishing a model that always answers LOW, one
/// publishing a model that always answers HIGH.
fn fixture() -> (Fixture, RunIdentity, RunIdentity) {
    let temp = tempdir().unwrap();
    let settings: Settings = test_settings(temp.path());
    let working_dir = temp.path().join("data");
    std::fs::create_dir_all(&working_dir).unwrap();
    write_normalized_dataset(&working_dir.join("games.csv"), 2_557, 1);

    let registry = settings.model_registry();
    for (name, label) in [("low", LOW), ("high", HIGH)] {
        registry
            .register(
                name,
                &ModelHandle::MajorityClass {
                    label: label.into(),
                },
                &Hyperparameters::MajorityClass,
                &ClassificationScores::zero(),
            )
            .unwrap();
    }

    let exchange = ArtifactExchange::in_memory();
    let run_a = RunIdentity::generate();
    let run_b = RunIdentity::generate();
    let low = json!({ "model_path_full": "registry:/low/1" });
    let high = json!({ "model_path_full": "registry:/high@latest-missing" });
    exchange.publish(&run_a, "training_flow", &low, "a").unwrap();
    exchange.publish(&run_b, "training_flow", &high, "b").unwrap();

    let orchestrator = FlowOrchestrator::new(
        Arc::new(settings),
        Arc::new(stages::default_registry()),
        exchange,
    );
    (
        Fixture {
            _temp: temp,
            working_dir,
            orchestrator,
        },
        run_a,
        run_b,
    )
}

fn invocation(
    working_dir: &std::path::Path,
    run_a: &RunIdentity,
    run_b: &RunIdentity,
    extra: Value,
) -> Invocation {
    let mut kwargs = json!({ "seed": 42, "cutoff_year": 2020 });
    if let (Some(base), Some(extra)) = (kwargs.as_object_mut(), extra.as_object()) {
        base.extend(extra.clone());
    }
    Invocation::parse(
        &json!({
            "args": [
                working_dir.display().to_string(),
                "games.csv",
                run_a.as_str(),
                run_b.as_str(),
            ],
            "kwargs": kwargs,
            "commit_id": "feedbeef",
        })
        .to_string(),
    )
}

#[tokio::test]
async fn abtest_scores_each_cohort_with_its_model() {
    let (fx, run_a, _) = fixture();
    let exchange = fx.orchestrator.exchange().clone();
    let run_b = RunIdentity::generate();
    exchange
        .publish(&run_b, "training_flow", &json!({ "model_path_full": "registry:/high/1" }), "b")
        .unwrap();

    let report = fx
        .orchestrator
        .abtest(&invocation(&fx.working_dir, &run_a, &run_b, json!({})))
        .await
        .unwrap();

    let results = &report.metadata["Results"];
    let a = &results["results_A"];
    let b = &results["results_B"];
    assert_eq!(a["model"], json!("registry:/low/1"));
    assert_eq!(b["model"], json!("registry:/high/1"));

    // days 1826..=2556 cover 2020 and 2021, the years past the cutoff
    let filtered = 731u64;
    let size_a = a["groupsize"].as_u64().unwrap();
    let size_b = b["groupsize"].as_u64().unwrap();
    assert!(size_a > 0 && size_b > 0);
    assert!(size_a + size_b <= filtered);
    for size in [size_a, size_b] {
        let share = size as f64 / filtered as f64;
        assert!((0.25..0.42).contains(&share), "cohort share {share}");
    }
    // majority models get roughly half of each balanced cohort right
    for cohort in [a, b] {
        let accuracy = cohort["accuracy"].as_f64().unwrap();
        assert!((0.35..0.65).contains(&accuracy), "accuracy {accuracy}");
    }

    assert_eq!(report.metadata["kwargs"]["flow_run_id_A"], json!(run_a.as_str()));
    assert_eq!(report.metadata["git_commit_hexsha"], json!("feedbeef"));
    assert_eq!(
        exchange.fetch(&report.run_id).unwrap(),
        report.metadata,
        "the published {ABTEST_KEY} document round-trips"
    );
}

#[tokio::test]
async fn abtest_is_reproducible_for_a_seed() {
    let (fx, run_a, _) = fixture();
    let exchange = fx.orchestrator.exchange().clone();
    let run_b = RunIdentity::generate();
    exchange
        .publish(&run_b, "training_flow", &json!({ "model_path_full": "registry:/high/1" }), "b")
        .unwrap();

    let inv = invocation(&fx.working_dir, &run_a, &run_b, json!({ "split_strategy": "halves" }));
    let first = fx.orchestrator.abtest(&inv).await.unwrap();
    let second = fx.orchestrator.abtest(&inv).await.unwrap();
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.metadata["Results"], second.metadata["Results"]);

    let halves = first.metadata["Results"]["results_A"]["groupsize"].as_u64().unwrap()
        + first.metadata["Results"]["results_B"]["groupsize"].as_u64().unwrap();
    assert_eq!(halves, 731);
}

#[tokio::test]
async fn unresolvable_model_aborts_the_run() {
    let (fx, run_a, run_b) = fixture();
    let err = fx
        .orchestrator
        .abtest(&invocation(&fx.working_dir, &run_a, &run_b, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::StageAborted { ref stage, .. } if stage == "evaluate_cohort_B"
    ));
}

#[tokio::test]
async fn upstream_artifact_problems_are_fatal() {
    let (fx, run_a, _) = fixture();
    let exchange = fx.orchestrator.exchange().clone();

    let missing = RunIdentity::generate();
    let err = fx
        .orchestrator
        .abtest(&invocation(&fx.working_dir, &run_a, &missing, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Artifact(ArtifactError::NotFound { .. })));

    let twice = RunIdentity::generate();
    let payload = json!({ "model_path_full": "registry:/high/1" });
    for _ in 0..2 {
        exchange
            .publish(&twice, "training_flow", &payload, "dup")
            .unwrap();
    }
    let err = fx
        .orchestrator
        .abtest(&invocation(&fx.working_dir, &run_a, &twice, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::Artifact(ArtifactError::Ambiguous { count: 2, .. })
    ));

    let fallback_run = RunIdentity::generate();
    exchange
        .publish(&fallback_run, "training_flow", &json!({ "model_path_full": null }), "fallback")
        .unwrap();
    let err = fx
        .orchestrator
        .abtest(&invocation(&fx.working_dir, &run_a, &fallback_run, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Artifact(ArtifactError::Corrupt { .. })));
}

#[tokio::test]
async fn malformed_policy_is_rejected_before_the_run() {
    let (fx, run_a, run_b) = fixture();
    for extra in [
        json!({ "hash_strategy": "md5" }),
        json!({ "split_strategy": { "a_below": 0.9, "b_from": 0.1 } }),
        json!({ "split_strategy": 12 }),
    ] {
        let err = fx
            .orchestrator
            .abtest(&invocation(&fx.working_dir, &run_a, &run_b, extra))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Validation(_)), "got {err}");
    }
}
