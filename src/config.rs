use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Root folder holding one workspace directory per user
    pub root_dir: PathBuf,
    /// Shared folder of start models offered on the training page
    pub template_dir: PathBuf,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Program that wraps the external training toolchain
    pub program: String,
    /// Arguments always passed before the per-job ones
    pub base_args: Vec<String>,
    /// Checkout of the external toolchain; it drops artifacts into `data/` below this
    pub work_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            root_dir: base.join("files"),
            template_dir: base.join("template"),
            training: TrainingConfig::default(),
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            program: "make".to_string(),
            base_args: vec!["training".to_string()],
            work_dir: None,
        }
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path {
            Some(path) => match Self::load_from_path(path) {
                Ok(config) => config,
                Err(err) => {
                    warn!(error = %err, "failed to load config file, using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root_dir.join("accounts.db")
    }

    /// Folder the external tool populates during a run, moved into the
    /// user's results folder afterwards.
    pub fn artifact_dir(&self) -> PathBuf {
        match &self.training.work_dir {
            Some(dir) => dir.join("data"),
            None => self.root_dir.join("data"),
        }
    }
}

fn default_base_dir() -> PathBuf {
    match ProjectDirs::from("none", "tesstrain", "tesstrain-web") {
        Some(dirs) => dirs.data_dir().to_path_buf(),
        None => PathBuf::from("."),
    }
}
