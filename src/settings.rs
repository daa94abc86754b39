use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactExchange, FsArtifactStore, LocalLog};
use crate::dataset::{DatasetSchema, default_renames};
use crate::registry::ModelRegistry;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    pub artifacts: ArtifactSettings,
    pub registry: RegistrySettings,
    pub dataset: DatasetSettings,
    pub training: TrainingSettings,
    pub stages: StageSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            artifacts: ArtifactSettings::default(),
            registry: RegistrySettings::default(),
            dataset: DatasetSettings::default(),
            training: TrainingSettings::default(),
            stages: StageSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings YAML: {}", path.display()))?;
        Ok(settings)
    }

    /// Loads `path` when given, otherwise the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn exchange(&self) -> ArtifactExchange {
        ArtifactExchange::new(
            Arc::new(FsArtifactStore::new(&self.artifacts.store_dir)),
            Some(LocalLog::new(
                &self.artifacts.local_log,
                &self.artifacts.run_log,
            )),
        )
    }

    pub fn model_registry(&self) -> ModelRegistry {
        ModelRegistry::open(&self.registry.root)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactSettings {
    pub store_dir: PathBuf,
    pub local_log: PathBuf,
    pub run_log: PathBuf,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".cohort-flow/artifacts"),
            local_log: PathBuf::from("Flow_Artifacts_Local.txt"),
            run_log: PathBuf::from("Flow_Ids.txt"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub root: PathBuf,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".cohort-flow/models"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatasetSettings {
    pub source: Option<PathBuf>,
    #[serde(flatten)]
    pub schema: DatasetSchema,
    pub renames: BTreeMap<String, String>,
    pub quantile_column: String,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            source: None,
            schema: DatasetSchema::default(),
            renames: default_renames(),
            quantile_column: "price".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub hyperparameters: PathBuf,
    pub min_train_rows: usize,
    pub test_fraction: f64,
    pub split_seed: u64,
    pub backup_alias: String,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            hyperparameters: PathBuf::from("model_hyperparameters.json"),
            min_train_rows: 1000,
            test_fraction: 0.2,
            split_seed: 42,
            backup_alias: "Backup".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StageSettings {
    pub default_timeout_secs: u64,
    pub default_retries: u32,
    pub validation_timeout_secs: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            default_retries: 0,
            validation_timeout_secs: 60,
        }
    }
}
