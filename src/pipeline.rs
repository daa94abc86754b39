use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{Instrument, debug, info, warn};

use crate::context::RunContext;
use crate::observability::MetricsCollector;
use crate::settings::Settings;

pub type StageParameters = Map<String, Value>;

/// What a stage attempt gets to see: the run it belongs to, the settings, and
/// the records of every stage that finished before it.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run: RunContext,
    pub settings: Arc<Settings>,
    pub previous: Vec<StageRecord>,
}

impl StageContext {
    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.previous
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &StageContext) -> Result<Value>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Declarative description of one stage in a linear pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub params: Option<StageParameters>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl StageSpec {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_params(mut self, params: StageParameters) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().try_into().unwrap_or(u64::MAX));
        self
    }

    /// Label when set, registry name otherwise.
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Error,
    TimedOut,
    Panicked,
    InvalidStage,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailureReason::Error => "error",
            FailureReason::TimedOut => "timed_out",
            FailureReason::Panicked => "panicked",
            FailureReason::InvalidStage => "invalid_stage",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl StageFailure {
    fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

/// Result of a stage, kept as data for later stages and the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded(Value),
    Failed(StageFailure),
}

impl StageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            StageOutcome::Succeeded(value) => Some(value),
            StageOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&StageFailure> {
        match self {
            StageOutcome::Succeeded(_) => None,
            StageOutcome::Failed(failure) => Some(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub stage: String,
    pub params: StageParameters,
    pub attempts: u32,
    pub duration_ms: f64,
    pub outcome: StageOutcome,
}

/// Runs stages strictly one after another. A failing stage never stops the
/// executor; its outcome is recorded and the caller decides what happens next.
pub struct PipelineExecutor {
    registry: Arc<StageRegistry>,
    run: RunContext,
    settings: Arc<Settings>,
    metrics: MetricsCollector,
    records: Vec<StageRecord>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<StageRegistry>, run: RunContext, settings: Arc<Settings>) -> Self {
        Self {
            registry,
            run,
            settings,
            metrics: MetricsCollector::new(),
            records: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StageRecord> {
        self.records
    }

    pub fn outcome(&self, name: &str) -> Option<&StageOutcome> {
        self.records
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }

    /// Executes every spec in order, regardless of earlier failures.
    pub async fn execute(&mut self, specs: &[StageSpec]) -> &[StageRecord] {
        let start = self.records.len();
        let total_start = Instant::now();
        for spec in specs {
            self.run_stage(spec).await;
        }
        self.metrics.record_total_duration(total_start.elapsed());
        &self.records[start..]
    }

    /// Executes one stage with its retry and timeout budget and records the outcome.
    pub async fn run_stage(&mut self, spec: &StageSpec) -> &StageRecord {
        let name = spec.name().to_string();
        let params = spec.params.clone().unwrap_or_default();
        let retries = spec.retries.unwrap_or(self.settings.stages.default_retries);
        let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs(self.settings.stages.default_timeout_secs));

        let span = tracing::info_span!("stage", stage = %name, run_id = %self.run.run_id);
        let started = Instant::now();
        let (attempts, outcome) = self
            .attempt_all(spec, &name, params.clone(), retries, timeout)
            .instrument(span)
            .await;

        self.metrics.record_outcome(&name, &outcome);
        let record = StageRecord {
            name,
            stage: spec.stage.clone(),
            params,
            attempts,
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            outcome,
        };
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    async fn attempt_all(
        &self,
        spec: &StageSpec,
        name: &str,
        params: StageParameters,
        retries: u32,
        timeout: Duration,
    ) -> (u32, StageOutcome) {
        let stage: Arc<dyn Stage> = match self.registry.create(&spec.stage, params) {
            Ok(stage) => Arc::from(stage),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "Stage could not be constructed");
                return (
                    0,
                    StageOutcome::Failed(StageFailure::new(
                        FailureReason::InvalidStage,
                        format!("{err:#}"),
                    )),
                );
            }
        };

        let max_attempts = retries.saturating_add(1);
        let mut last_failure = None;
        for attempt in 1..=max_attempts {
            debug!(
                attempt,
                max_attempts,
                timeout_ms = timeout.as_millis() as u64,
                "Dispatching stage"
            );
            let ctx = StageContext {
                run: self.run.clone(),
                settings: self.settings.clone(),
                previous: self.records.clone(),
            };
            let timer = self.metrics.start_attempt(name);
            let result = run_attempt(stage.clone(), ctx, timeout).await;
            drop(timer);

            match result {
                Ok(value) => {
                    info!(attempt, "Stage succeeded");
                    return (attempt, StageOutcome::Succeeded(value));
                }
                Err(failure) => {
                    warn!(
                        attempt,
                        max_attempts,
                        reason = %failure.reason,
                        message = %failure.message,
                        "Stage attempt failed"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        let failure = last_failure.unwrap_or_else(|| {
            StageFailure::new(FailureReason::Error, "stage made no attempts")
        });
        (max_attempts, StageOutcome::Failed(failure))
    }
}

/// Drives `future` to completion on a fresh multi-threaded runtime.
///
/// Blocking threads left behind by timed-out attempts get at most `grace` to
/// finish once `future` is done; after that the runtime is torn down without
/// them.
pub fn block_on<F: Future>(future: F, grace: Duration) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

/// Runs one attempt on the blocking pool. On timeout the attempt is abandoned:
/// its thread keeps running to completion but its result is discarded.
async fn run_attempt(
    stage: Arc<dyn Stage>,
    ctx: StageContext,
    timeout: Duration,
) -> std::result::Result<Value, StageFailure> {
    let handle = tokio::task::spawn_blocking(move || stage.run(&ctx));
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => Err(StageFailure::new(
            FailureReason::TimedOut,
            format!("attempt exceeded {} ms", timeout.as_millis()),
        )),
        Ok(Err(join_err)) if join_err.is_panic() => Err(StageFailure::new(
            FailureReason::Panicked,
            panic_message(join_err.into_panic()),
        )),
        Ok(Err(join_err)) => Err(StageFailure::new(FailureReason::Error, join_err.to_string())),
        Ok(Ok(Err(err))) => Err(StageFailure::new(FailureReason::Error, format!("{err:#}"))),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked".to_string()
    }
}
