use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use cohort_flow::context::RunIdentity;
use cohort_flow::flows::{FlowOrchestrator, FlowReport};
use cohort_flow::invocation::Invocation;
use cohort_flow::observability::{MetricsCollector, log_snapshot};
use cohort_flow::pipeline::block_on;
use cohort_flow::settings::Settings;
use cohort_flow::stages;
use cohort_flow::validation::validate_settings;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

/// How long abandoned stage attempts may hold up process exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;
    block_on(run(cli), SHUTDOWN_GRACE)?
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load_or_default(cli.config.as_deref())?;
    let metrics = MetricsCollector::new();

    match cli.command {
        Commands::Abtest { blob } => {
            let orchestrator =
                FlowOrchestrator::from_settings(settings).with_metrics(metrics.clone());
            let report = orchestrator
                .abtest(&Invocation::from_optional(blob.as_deref()))
                .await?;
            print_flow_report(&report);
        }
        Commands::Train { blob } => {
            let orchestrator =
                FlowOrchestrator::from_settings(settings).with_metrics(metrics.clone());
            let report = orchestrator
                .train(&Invocation::from_optional(blob.as_deref()))
                .await?;
            print_flow_report(&report);
        }
        Commands::Monitor { blob } => {
            let orchestrator =
                FlowOrchestrator::from_settings(settings).with_metrics(metrics.clone());
            let report = orchestrator
                .monitor(&Invocation::from_optional(blob.as_deref()))
                .await?;
            print_flow_report(&report);
        }
        Commands::Fetch { run_id } => {
            let payload = settings.exchange().fetch(&RunIdentity::from(run_id))?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::ListStages => list_stages(),
        Commands::Validate => validate_settings_cmd(&settings, cli.config.as_deref())?,
        Commands::Registry { action } => match action {
            RegistryCommands::SetAlias {
                name,
                alias,
                version,
            } => {
                settings.model_registry().set_alias(&name, &alias, version)?;
                println!("{name}@{alias} -> version {version}");
            }
        },
    }

    write_metrics(
        &metrics,
        cli.print_metrics,
        cli.metrics_json.as_deref(),
        cli.metrics_prometheus.as_deref(),
    )
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

fn print_flow_report(report: &FlowReport) {
    for record in &report.stages {
        info!(
            stage = %record.name,
            attempts = record.attempts,
            duration_ms = record.duration_ms,
            failed = record.outcome.is_failed(),
            "Stage summary"
        );
    }
    println!(
        "Flow ID: {}, Artifact ID: {}",
        report.run_id, report.artifact_id
    );
}

fn list_stages() {
    let registry = stages::default_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_settings_cmd(settings: &Settings, path: Option<&Path>) -> Result<()> {
    let registry = stages::default_registry();
    let report = validate_settings(settings, &registry);
    let file = path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<defaults>".to_string());

    for warning in &report.warnings {
        warn!(file = %file, "{warning}");
    }

    if report.is_ok() {
        info!(file = %file, "Settings validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %file, "{error_msg}");
        }
        Err(anyhow!(
            "Settings validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn write_metrics(
    metrics: &MetricsCollector,
    print_metrics: bool,
    metrics_json: Option<&Path>,
    metrics_prometheus: Option<&Path>,
) -> Result<()> {
    if !print_metrics && metrics_json.is_none() && metrics_prometheus.is_none() {
        return Ok(());
    }
    let snapshot = metrics.snapshot();
    if print_metrics {
        log_snapshot(&snapshot);
    }
    if let Some(path) = metrics_json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, &snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = metrics_prometheus {
        ensure_parent(path)?;
        std::fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create metrics directory: {}", parent.display()))?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "cohort-flow",
    version,
    about = "Staged model training, monitoring and A/B evaluation flows"
)]
struct Cli {
    /// Settings file (YAML); built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    print_metrics: bool,
    #[arg(long = "metrics-json", global = true)]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus", global = true)]
    metrics_prometheus: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the models of two earlier runs on cohorts A and B.
    Abtest {
        /// JSON blob: {"args": [...], "kwargs": {...}, "commit_id": "..."}
        blob: Option<String>,
    },
    /// Data quality, training and validation with backup fallback.
    Train { blob: Option<String> },
    /// Score a model on reference and current data and report drift.
    Monitor { blob: Option<String> },
    /// Print the metadata document published by a run.
    Fetch { run_id: String },
    ListStages,
    Validate,
    Registry {
        #[command(subcommand)]
        action: RegistryCommands,
    },
}

#[derive(Subcommand)]
enum RegistryCommands {
    SetAlias {
        #[arg(long)]
        name: String,
        #[arg(long)]
        alias: String,
        #[arg(long)]
        version: u32,
    },
}
