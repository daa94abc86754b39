use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::info;

use crate::model::{Hyperparameters, ModelHandle};
use crate::scoring::ClassificationScores;

pub const REGISTRY_SCHEME: &str = "registry:/";
const MODEL_FILE: &str = "model.json";
const ALIASES_FILE: &str = "aliases.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelVersion {
    Number(u32),
    Latest,
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelVersion::Number(v) => write!(f, "{v}"),
            ModelVersion::Latest => f.write_str("latest"),
        }
    }
}

/// Deferred handle to a model, resolved to a predictor once at point of use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReference {
    Path(PathBuf),
    Version { name: String, version: ModelVersion },
    Alias { name: String, alias: String },
}

impl ModelReference {
    pub fn version(name: impl Into<String>, version: u32) -> Self {
        ModelReference::Version {
            name: name.into(),
            version: ModelVersion::Number(version),
        }
    }

    pub fn latest(name: impl Into<String>) -> Self {
        ModelReference::Version {
            name: name.into(),
            version: ModelVersion::Latest,
        }
    }

    pub fn alias(name: impl Into<String>, alias: impl Into<String>) -> Self {
        ModelReference::Alias {
            name: name.into(),
            alias: alias.into(),
        }
    }

    /// Picks a reference by precedence: explicit path, then alias, then
    /// version (`latest` when absent).
    pub fn select(
        name: &str,
        version: Option<&str>,
        alias: Option<&str>,
        path: Option<&str>,
    ) -> Result<Self> {
        if let Some(path) = path {
            return path.parse();
        }
        if let Some(alias) = alias {
            return Ok(Self::alias(name, alias));
        }
        match version {
            None | Some("latest") => Ok(Self::latest(name)),
            Some(raw) => {
                let number = raw
                    .parse::<u32>()
                    .with_context(|| format!("Invalid model version '{raw}'"))?;
                Ok(Self::version(name, number))
            }
        }
    }
}

impl FromStr for ModelReference {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("Model reference cannot be empty");
        }
        let Some(rest) = raw.strip_prefix(REGISTRY_SCHEME) else {
            return Ok(ModelReference::Path(PathBuf::from(raw)));
        };
        if let Some((name, alias)) = rest.split_once('@') {
            if name.is_empty() || alias.is_empty() || alias.contains('/') {
                bail!("Malformed alias reference '{raw}', expected {REGISTRY_SCHEME}<name>@<alias>");
            }
            return Ok(Self::alias(name, alias));
        }
        match rest.split_once('/') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Self::select(name, Some(version), None, None)
            }
            _ => bail!(
                "Malformed version reference '{raw}', expected {REGISTRY_SCHEME}<name>/<version>"
            ),
        }
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelReference::Path(path) => write!(f, "{}", path.display()),
            ModelReference::Version { name, version } => {
                write!(f, "{REGISTRY_SCHEME}{name}/{version}")
            }
            ModelReference::Alias { name, alias } => write!(f, "{REGISTRY_SCHEME}{name}@{alias}"),
        }
    }
}

/// Filesystem model registry: `<root>/<name>/<version>/model.json`.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    root: PathBuf,
}

impl ModelRegistry {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores `model` as the next version of `name` and returns that version.
    pub fn register(
        &self,
        name: &str,
        model: &ModelHandle,
        hyperparameters: &Hyperparameters,
        scores: &ClassificationScores,
    ) -> Result<u32> {
        validate_name(name)?;
        let model_dir = self.root.join(name);
        fs::create_dir_all(&model_dir).with_context(|| {
            format!("Failed to create registry directory: {}", model_dir.display())
        })?;

        let mut version = self.versions(name)?.last().copied().unwrap_or(0) + 1;
        let version_dir = loop {
            let candidate = model_dir.join(version.to_string());
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => version += 1,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("Failed to create model version: {}", candidate.display())
                    });
                }
            }
        };

        write_json(&version_dir.join(MODEL_FILE), model)?;
        write_json(&version_dir.join("hyperparameters.json"), hyperparameters)?;
        write_json(&version_dir.join("metrics.json"), scores)?;
        info!(model = name, version, "Model registered");
        Ok(version)
    }

    pub fn versions(&self, name: &str) -> Result<Vec<u32>> {
        let model_dir = self.root.join(name);
        if !model_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&model_dir)
            .with_context(|| format!("Failed to list registry: {}", model_dir.display()))?
        {
            let entry = entry?;
            if entry.path().join(MODEL_FILE).is_file()
                && let Some(version) = entry.file_name().to_str().and_then(|n| n.parse().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn aliases(&self, name: &str) -> Result<BTreeMap<String, u32>> {
        let path = self.root.join(name).join(ALIASES_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read aliases: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse aliases: {}", path.display()))
    }

    pub fn set_alias(&self, name: &str, alias: &str, version: u32) -> Result<()> {
        validate_name(alias)?;
        if !self.versions(name)?.contains(&version) {
            bail!("Model '{name}' has no version {version}");
        }
        let mut aliases = self.aliases(name)?;
        aliases.insert(alias.to_string(), version);
        write_json(&self.root.join(name).join(ALIASES_FILE), &aliases)?;
        info!(model = name, alias, version, "Model alias updated");
        Ok(())
    }

    pub fn resolve(&self, reference: &ModelReference) -> Result<ModelHandle> {
        let path = match reference {
            ModelReference::Path(path) if path.is_dir() => path.join(MODEL_FILE),
            ModelReference::Path(path) => path.clone(),
            ModelReference::Version { name, version } => {
                let number = match version {
                    ModelVersion::Number(number) => *number,
                    ModelVersion::Latest => self
                        .versions(name)?
                        .last()
                        .copied()
                        .ok_or_else(|| anyhow!("Model '{name}' has no registered versions"))?,
                };
                self.root.join(name).join(number.to_string()).join(MODEL_FILE)
            }
            ModelReference::Alias { name, alias } => {
                let version = self
                    .aliases(name)?
                    .get(alias)
                    .copied()
                    .ok_or_else(|| anyhow!("Model '{name}' has no alias '{alias}'"))?;
                self.root.join(name).join(version.to_string()).join(MODEL_FILE)
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to load model {reference} from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse model {reference}"))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() || name.contains(['/', '@', '\\']) || name == "." || name == ".." {
        bail!("Invalid registry name '{name}'");
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write JSON: {}", path.display()))
}
