use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_derive::Serialize;

/// Per-user folder layout under the configured root:
/// `<root>/<username>/` holds the image/ground-truth pairs,
/// `<root>/<username>/logs/` the training run logs and
/// `<root>/<username>/results/` the trained model artifacts.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    template_dir: PathBuf,
}

/// An uploaded scanned image and its transcription, if one was uploaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairEntry {
    pub image: String,
    pub ground_truth: Option<String>,
}

impl Workspace {
    pub fn new(root: PathBuf, template_dir: PathBuf) -> Self {
        Self { root, template_dir }
    }

    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    pub fn logs_dir(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("logs")
    }

    pub fn results_dir(&self, username: &str) -> PathBuf {
        self.user_dir(username).join("results")
    }

    /// Lists uploaded images with their paired `<image>.gt.txt` transcription.
    /// Pairing is case-insensitive; images without a transcription are listed
    /// with an empty slot.
    pub fn list_image_pairs(&self, username: &str) -> Result<Vec<PairEntry>> {
        let dir = self.user_dir(username);
        let names = sorted_file_names(&dir)?;

        let by_lower: HashMap<String, String> =
            names.iter().map(|n| (n.to_lowercase(), n.clone())).collect();

        let mut pairs = Vec::new();
        for name in &names {
            let lower = name.to_lowercase();
            if !(lower.ends_with(".tif") || lower.ends_with(".png")) {
                continue;
            }
            let ground_truth = by_lower.get(&format!("{lower}.gt.txt")).cloned();
            pairs.push(PairEntry {
                image: name.clone(),
                ground_truth,
            });
        }
        Ok(pairs)
    }

    pub fn list_results(&self, username: &str) -> Result<Vec<String>> {
        sorted_file_names(&self.results_dir(username))
    }

    pub fn list_logs(&self, username: &str) -> Result<Vec<String>> {
        sorted_file_names(&self.logs_dir(username))
    }

    /// All start models available to begin a training run from.
    pub fn list_templates(&self) -> Result<Vec<String>> {
        sorted_file_names(&self.template_dir)
    }

    pub fn is_pair_filename(name: &str) -> bool {
        let lower = name.to_lowercase();
        lower.ends_with(".png") || lower.ends_with(".tif") || lower.ends_with(".gt.txt")
    }

    /// Saves an uploaded pair file under its basename, stripping any path
    /// the client sent along.
    pub fn save_pair_file(&self, username: &str, filename: &str, data: &[u8]) -> Result<PathBuf> {
        let basename = Path::new(filename)
            .file_name()
            .context("upload has no file name")?;
        let dir = self.user_dir(username);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(basename);
        std::fs::write(&path, data)
            .with_context(|| format!("failed to save upload {}", path.display()))?;
        Ok(path)
    }

    /// Allocates a fresh log file for one training run. The name carries a
    /// UTC timestamp with microseconds; create-new semantics guarantee a
    /// path is never handed out twice.
    pub fn allocate_log(&self, username: &str) -> Result<PathBuf> {
        let dir = self.logs_dir(username);
        std::fs::create_dir_all(&dir)?;

        loop {
            let name = format!("log_{}.log", Utc::now().format("%Y%m%d_%H%M%S_%6f"));
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create log file {}", path.display()))
                }
            }
        }
    }
}

fn sorted_file_names(dir: &Path) -> Result<Vec<String>> {
    std::fs::create_dir_all(dir)?;
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry
                .file_type()
                .ok()?
                .is_file()
                .then(|| entry.file_name().to_string_lossy().into_owned())
        })
        .collect();
    names.sort();
    Ok(names)
}
