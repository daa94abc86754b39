use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::pipeline::{FailureReason, StageOutcome};

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared per-run counters. Clones share the same snapshot.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times one attempt; the duration is recorded when the guard drops.
    pub fn start_attempt(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
        }
    }

    pub fn record_outcome(&self, stage_name: &str, outcome: &StageOutcome) {
        if let Ok(mut guard) = self.inner.lock() {
            let metrics = guard.stages.entry(stage_name.to_string()).or_default();
            match outcome {
                StageOutcome::Succeeded(_) => metrics.successes += 1,
                StageOutcome::Failed(failure) => {
                    metrics.failures += 1;
                    if failure.reason == FailureReason::TimedOut {
                        metrics.timeouts += 1;
                    }
                }
            }
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms += duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.attempts += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage attempt duration recorded"
        );
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        "Flow metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            attempts = metrics.attempts,
            successes = metrics.successes,
            failures = metrics.failures,
            timeouts = metrics.timeouts,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        let counters: [(&str, &str, fn(&StageMetrics) -> u64); 4] = [
            (
                "cohort_flow_stage_attempts_total",
                "Stage attempts, retries included",
                |m: &StageMetrics| m.attempts,
            ),
            (
                "cohort_flow_stage_successes_total",
                "Stages that finished successfully",
                |m: &StageMetrics| m.successes,
            ),
            (
                "cohort_flow_stage_failures_total",
                "Stages that exhausted their attempts",
                |m: &StageMetrics| m.failures,
            ),
            (
                "cohort_flow_stage_timeouts_total",
                "Stages whose final attempt timed out",
                |m: &StageMetrics| m.timeouts,
            ),
        ];
        for (metric, help, value) in counters {
            output.push_str(&format!("# HELP {metric} {help}\n"));
            output.push_str(&format!("# TYPE {metric} counter\n"));
            for (stage, metrics) in &self.stages {
                output.push_str(&format!("{metric}{{stage=\"{stage}\"}} {}\n", value(metrics)));
            }
        }
        output.push_str(concat!(
            "# HELP cohort_flow_stage_duration_seconds_total ",
            "Accumulated attempt duration in seconds\n",
        ));
        output.push_str("# TYPE cohort_flow_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP cohort_flow_stage_duration_seconds_max Longest single attempt in seconds\n",
        );
        output.push_str("# TYPE cohort_flow_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "cohort_flow_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "cohort_flow_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP cohort_flow_duration_seconds Total flow duration\n");
        output.push_str("# TYPE cohort_flow_duration_seconds gauge\n");
        output.push_str(&format!(
            "cohort_flow_duration_seconds {:.6}\n",
            self.total_duration_ms / 1_000.0
        ));
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageFailure;
    use serde_json::json;

    #[test]
    fn counts_attempts_and_outcomes() {
        let collector = MetricsCollector::new();
        drop(collector.start_attempt("train_model"));
        drop(collector.start_attempt("train_model"));
        collector.record_outcome(
            "train_model",
            &StageOutcome::Failed(StageFailure {
                reason: FailureReason::TimedOut,
                message: "slow".into(),
            }),
        );
        collector.record_outcome("data_quality", &StageOutcome::Succeeded(json!({})));

        let snapshot = collector.snapshot();
        let train = &snapshot.stages["train_model"];
        assert_eq!(train.attempts, 2);
        assert_eq!(train.failures, 1);
        assert_eq!(train.timeouts, 1);
        assert_eq!(snapshot.stages["data_quality"].successes, 1);

        let text = snapshot.to_prometheus();
        assert!(text.contains("cohort_flow_stage_attempts_total{stage=\"train_model\"} 2"));
        assert!(text.contains("cohort_flow_stage_timeouts_total{stage=\"train_model\"} 1"));
    }
}
