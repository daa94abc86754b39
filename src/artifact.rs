//! Cross-run artifact exchange.
//!
//! A run publishes one JSON payload wrapped in a markdown document; a later,
//! independent run fetches it back by the publishing run's identity. Every
//! publish is also appended to a local log. The store and the log are two
//! separate writes with no transaction between them: a crash or a store outage
//! can leave them out of step, and nothing here reconciles them.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RunIdentity;
use crate::error::ArtifactError;

static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```json\s*\n(.*?)\n```").expect("json block pattern is valid")
});

/// Wraps `payload` in the markdown wire format: one fenced `json` block.
pub fn render_markdown(payload: &Value) -> Result<String> {
    let body = serde_json::to_string_pretty(payload).context("Failed to serialize payload")?;
    Ok(format!("```json\n{body}\n```"))
}

/// Body of the first fenced `json` block in `markdown`, if any.
pub fn extract_json_block(markdown: &str) -> Option<&str> {
    JSON_BLOCK
        .captures(markdown)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: RunIdentity,
    pub key: String,
    pub description: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub id: String,
    pub run_id: RunIdentity,
    pub key: String,
    pub description: String,
    pub data: String,
    pub created_at: DateTime<Utc>,
}

impl StoredArtifact {
    fn from_new(artifact: NewArtifact) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: artifact.run_id,
            key: artifact.key,
            description: artifact.description,
            data: artifact.data,
            created_at: Utc::now(),
        }
    }
}

/// Backing store for artifacts. One logical store, no access control.
pub trait ArtifactStore: Send + Sync {
    fn create(&self, artifact: NewArtifact) -> Result<StoredArtifact>;
    fn find_by_run(&self, run_id: &RunIdentity) -> Result<Vec<StoredArtifact>>;
}

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<Vec<StoredArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn create(&self, artifact: NewArtifact) -> Result<StoredArtifact> {
        let stored = StoredArtifact::from_new(artifact);
        self.artifacts
            .lock()
            .map_err(|_| anyhow!("artifact store lock poisoned"))?
            .push(stored.clone());
        Ok(stored)
    }

    fn find_by_run(&self, run_id: &RunIdentity) -> Result<Vec<StoredArtifact>> {
        Ok(self
            .artifacts
            .lock()
            .map_err(|_| anyhow!("artifact store lock poisoned"))?
            .iter()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect())
    }
}

/// One JSON file per artifact under a directory.
///
/// Files are staged and renamed into place. A `.json` file that does not parse
/// fails the lookup instead of being skipped.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn create(&self, artifact: NewArtifact) -> Result<StoredArtifact> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create artifact store: {}", self.dir.display()))?;
        let stored = StoredArtifact::from_new(artifact);
        let path = self.dir.join(format!("{}.json", stored.id));
        // staged under .tmp, which find_by_run ignores until the rename
        let staging = self.dir.join(format!("{}.json.tmp", stored.id));
        let file = fs::File::create(&staging)
            .with_context(|| format!("Failed to create artifact file: {}", staging.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &stored)
            .with_context(|| format!("Failed to write artifact file: {}", staging.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush artifact file: {}", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("Failed to move artifact into place: {}", path.display()))?;
        Ok(stored)
    }

    fn find_by_run(&self, run_id: &RunIdentity) -> Result<Vec<StoredArtifact>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list artifact store: {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read artifact file: {}", path.display()))?;
            let artifact: StoredArtifact = serde_json::from_str(&content)
                .with_context(|| format!("Unreadable artifact file: {}", path.display()))?;
            if &artifact.run_id == run_id {
                found.push(artifact);
            }
        }
        found.sort_by_key(|a| a.created_at);
        Ok(found)
    }
}

/// Entry appended to the local log for every publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub run_id: RunIdentity,
    pub key: String,
    pub payload: Value,
}

/// Append-only local record of published payloads and finished runs.
#[derive(Debug, Clone)]
pub struct LocalLog {
    artifacts_path: PathBuf,
    runs_path: PathBuf,
}

impl LocalLog {
    pub fn new(artifacts_path: impl Into<PathBuf>, runs_path: impl Into<PathBuf>) -> Self {
        Self {
            artifacts_path: artifacts_path.into(),
            runs_path: runs_path.into(),
        }
    }

    pub fn append_payload(&self, run_id: &RunIdentity, key: &str, payload: &Value) -> Result<()> {
        let entry = LogEntry {
            run_id: run_id.clone(),
            key: key.to_string(),
            payload: payload.clone(),
        };
        let line = serde_json::to_string(&entry).context("Failed to serialize log entry")?;
        append_line(&self.artifacts_path, &line)
    }

    pub fn record_run(&self, run_id: &RunIdentity) -> Result<()> {
        append_line(&self.runs_path, run_id.as_str())
    }

    /// Payload entries in append order, for offline recovery.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        read_lines(&self.artifacts_path)?
            .iter()
            .map(|line| {
                serde_json::from_str(line).with_context(|| {
                    format!("Malformed log entry in {}", self.artifacts_path.display())
                })
            })
            .collect()
    }

    pub fn runs(&self) -> Result<Vec<RunIdentity>> {
        Ok(read_lines(&self.runs_path)?
            .into_iter()
            .map(RunIdentity::from)
            .collect())
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log: {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("Failed to append to log: {}", path.display()))
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let file =
        fs::File::open(path).with_context(|| format!("Failed to open log: {}", path.display()))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Publish/fetch protocol over an [`ArtifactStore`] plus an optional [`LocalLog`].
#[derive(Clone)]
pub struct ArtifactExchange {
    store: Arc<dyn ArtifactStore>,
    log: Option<LocalLog>,
}

impl ArtifactExchange {
    pub fn new(store: Arc<dyn ArtifactStore>, log: Option<LocalLog>) -> Self {
        Self { store, log }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryArtifactStore::new()), None)
    }

    pub fn log(&self) -> Option<&LocalLog> {
        self.log.as_ref()
    }

    /// Publishes `payload` for `run_id` and returns the store's artifact id.
    ///
    /// The local log is written first so a store outage still leaves an
    /// offline copy; a log failure is only warned about.
    pub fn publish(
        &self,
        run_id: &RunIdentity,
        key: &str,
        payload: &Value,
        description: &str,
    ) -> Result<String, ArtifactError> {
        if let Some(log) = &self.log
            && let Err(err) = log.append_payload(run_id, key, payload)
        {
            warn!(run_id = %run_id, error = %format!("{err:#}"), "Local artifact log write failed");
        }

        let data =
            render_markdown(payload).map_err(|err| ArtifactError::Store(format!("{err:#}")))?;
        let stored = self
            .store
            .create(NewArtifact {
                run_id: run_id.clone(),
                key: key.to_string(),
                description: description.to_string(),
                data,
            })
            .map_err(|err| ArtifactError::Store(format!("{err:#}")))?;

        info!(run_id = %run_id, key, artifact_id = %stored.id, "Artifact published");
        Ok(stored.id)
    }

    /// Fetches the single artifact published by `run_id` and parses its payload.
    pub fn fetch(&self, run_id: &RunIdentity) -> Result<Value, ArtifactError> {
        let mut artifacts = self
            .store
            .find_by_run(run_id)
            .map_err(|err| ArtifactError::Store(format!("{err:#}")))?;

        let artifact = match artifacts.len() {
            0 => {
                return Err(ArtifactError::NotFound {
                    run_id: run_id.to_string(),
                });
            }
            1 => artifacts.remove(0),
            count => {
                return Err(ArtifactError::Ambiguous {
                    run_id: run_id.to_string(),
                    count,
                });
            }
        };

        let block = extract_json_block(&artifact.data).ok_or_else(|| ArtifactError::Corrupt {
            run_id: run_id.to_string(),
            reason: "no fenced json block found".to_string(),
        })?;
        let payload = serde_json::from_str(block).map_err(|err| ArtifactError::Corrupt {
            run_id: run_id.to_string(),
            reason: format!("JSON decode error: {err}"),
        })?;
        debug!(run_id = %run_id, artifact_id = %artifact.id, "Artifact fetched");
        Ok(payload)
    }

    /// Appends the run identity to the local run log, if one is configured.
    pub fn record_run(&self, run_id: &RunIdentity) {
        if let Some(log) = &self.log
            && let Err(err) = log.record_run(run_id)
        {
            warn!(run_id = %run_id, error = %format!("{err:#}"), "Local run log write failed");
        }
    }
}
