#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use cohort_flow::settings::Settings;

pub const LOW: &str = "0 - 20000";
pub const HIGH: &str = "20000 - 50000";

/// One synthetic game per `step_days`, starting 2015-01-01. Odd rows are
/// popular; review and recommendation counts separate the two classes.
pub fn game_rows(count: usize, step_days: i64) -> Vec<Vec<String>> {
    let start = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
    (0..count)
        .map(|i| {
            let popular = i % 2 == 1;
            let date = start + Duration::days(i as i64 * step_days);
            let jitter = (i * 37 % 100) as f64;
            let (label, positive, negative, recommendations, peak) = if popular {
                (HIGH, 5_000.0 + jitter, 800.0 + jitter, 3_000.0 + jitter, 400.0 + jitter)
            } else {
                (LOW, 20.0 + jitter, 5.0 + jitter, 10.0 + jitter, 1.0 + jitter)
            };
            vec![
                date.format("%Y-%m-%d").to_string(),
                label.to_string(),
                format!("{:.2}", (i % 60) as f64 + 0.99),
                positive.to_string(),
                negative.to_string(),
                ((i * 13) % 90).to_string(),
                peak.to_string(),
                recommendations.to_string(),
                ((i % 3) * 6).to_string(),
                if i % 4 == 0 { "True" } else { "False" }.to_string(),
                if i % 5 == 0 { "True" } else { "False" }.to_string(),
                "True".to_string(),
            ]
        })
        .collect()
}

const NORMALIZED_HEADER: [&str; 12] = [
    "release_date",
    "estimated_owners",
    "price",
    "positive_reviews",
    "negative_reviews",
    "metacritic_score",
    "peak_ccu",
    "recommendations",
    "required_age",
    "on_linux",
    "on_mac",
    "on_windows",
];

const RAW_HEADER: [&str; 12] = [
    "Release date",
    "Estimated owners",
    "Price",
    "Positive",
    "Negative",
    "Metacritic score",
    "Peak CCU",
    "Recommendations",
    "Required age",
    "Linux",
    "Mac",
    "Windows",
];

fn write_rows(path: &Path, header: &[&str], rows: &[Vec<String>]) {
    let mut writer = csv::Writer::from_path(path).unwrap();
    writer.write_record(header).unwrap();
    for row in rows {
        writer.write_record(row).unwrap();
    }
    writer.flush().unwrap();
}

/// Dataset already in the normalized schema, as the data-quality stage writes it.
pub fn write_normalized_dataset(path: &Path, count: usize, step_days: i64) {
    write_rows(path, &NORMALIZED_HEADER, &game_rows(count, step_days));
}

/// Dataset with the raw export's column names.
pub fn write_raw_dataset(path: &Path, count: usize, step_days: i64) {
    write_rows(path, &RAW_HEADER, &game_rows(count, step_days));
}

/// Settings rooted in `root`, with small training thresholds.
pub fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.artifacts.store_dir = root.join("artifacts");
    settings.artifacts.local_log = root.join("Flow_Artifacts_Local.txt");
    settings.artifacts.run_log = root.join("Flow_Ids.txt");
    settings.registry.root = root.join("models");
    settings.training.hyperparameters = root.join("model_hyperparameters.json");
    settings.training.min_train_rows = 50;
    settings
}

pub fn write_hyperparameters(settings: &Settings) -> PathBuf {
    let path = settings.training.hyperparameters.clone();
    fs::write(
        &path,
        r#"{"algorithm": "nearest_centroid", "standardize": true}"#,
    )
    .unwrap();
    path
}
