use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_derive::{Deserialize, Serialize};

use crate::config::TrainingConfig;

/// The external trainer invocation as an argv array. The program is spawned
/// directly, never through a shell, so submitted parameters cannot smuggle
/// in shell syntax.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
}

impl TrainingInvocation {
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Keeps alphanumerics, spaces, `/`, `=` and tab; everything else is
/// dropped. Secondary filter only; argv spawning is the actual defense.
pub fn sanitize_extra_parameters(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '/' | '=' | '\t'))
        .collect()
}

pub fn build_invocation(
    config: &TrainingConfig,
    model_name: &str,
    ground_truth_dir: &Path,
    start_model: Option<&str>,
    extra_parameters: &str,
) -> TrainingInvocation {
    let mut args = config.base_args.clone();
    args.push(format!("MODEL_NAME={model_name}"));
    args.push(format!("GROUND_TRUTH_DIR={}", ground_truth_dir.display()));
    if let Some(start_model) = start_model {
        args.push(format!("START_MODEL={start_model}"));
    }
    args.extend(extra_parameters.split_whitespace().map(str::to_string));

    TrainingInvocation {
        program: config.program.clone(),
        args,
        work_dir: config.work_dir.clone(),
    }
}

/// Moves any prior artifact for `model_name` out of the way before a new
/// run starts. Both the output directory and the `.traineddata` file are
/// checked; whichever exists is renamed with a timestamp suffix, never
/// deleted. Returns the renamed paths.
pub fn rename_aside_existing(result_dir: &Path, model_name: &str) -> Result<Vec<PathBuf>> {
    let mut renamed = Vec::new();
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

    let candidates = [
        result_dir.join(model_name),
        result_dir.join(format!("{model_name}.traineddata")),
    ];
    for path in candidates {
        if !path.exists() {
            continue;
        }
        let mut name = path
            .file_name()
            .context("artifact path has no file name")?
            .to_os_string();
        name.push(format!(".{stamp}"));
        let target = path.with_file_name(name);
        std::fs::rename(&path, &target).with_context(|| {
            format!("failed to rename {} to {}", path.display(), target.display())
        })?;
        renamed.push(target);
    }
    Ok(renamed)
}
