use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::training::{JobCoordinator, TrainingError, TrainingJob, TrainingStatus};

/// Executes one training job to completion. Runs detached from the request
/// that submitted it; everything observable about the run goes through the
/// log file and the coordinator. The slot is freed on every exit path.
pub async fn run_training(coordinator: Arc<JobCoordinator>, job: TrainingJob) {
    match coordinator.try_begin(&job.log_path) {
        Ok(ticket) => {
            let outcome = match execute(&job).await {
                Ok(true) => TrainingStatus::Completed,
                Ok(false) => TrainingStatus::Failed,
                Err(err) => {
                    if let Err(log_err) =
                        append_line(&job.log_path, &format!("Error: {err:#}")).await
                    {
                        error!(error = ?log_err, "failed to write error to training log");
                    }
                    error!(model = %job.model_name, error = ?err, "training run failed");
                    TrainingStatus::Failed
                }
            };
            ticket.finish(outcome);
        }
        Err(TrainingError::JobAlreadyRunning) => {
            if let Err(err) = append_line(
                &job.log_path,
                "A training run is already in progress, submission aborted",
            )
            .await
            {
                error!(error = ?err, "failed to write rejection to training log");
            }
            coordinator.mark(&job.log_path, TrainingStatus::Failed);
        }
    }
}

async fn execute(job: &TrainingJob) -> Result<bool> {
    append_line(&job.log_path, &format!("Running: {}", job.invocation.display())).await?;

    let status = supervise(job).await?;
    append_line(
        &job.log_path,
        &format!("training exited with status: {status}"),
    )
    .await?;

    if !status.success() {
        return Ok(false);
    }

    relocate_artifacts(&job.artifact_dir, &job.result_dir).await?;

    let log_name = job
        .log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    append_line(&job.log_path, &format!("Completed: {log_name}")).await?;
    info!(model = %job.model_name, user = %job.username, "training run completed");
    Ok(true)
}

/// Spawns the external trainer and funnels its stdout and stderr, line by
/// line, into the log file. Each line is flushed so a concurrent tail sees
/// output with minimal delay.
async fn supervise(job: &TrainingJob) -> Result<std::process::ExitStatus> {
    let mut command = Command::new(&job.invocation.program);
    command
        .args(&job.invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &job.invocation.work_dir {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", job.invocation.program))?;
    let stdout = child.stdout.take().context("child stdout not captured")?;
    let stderr = child.stderr.take().context("child stderr not captured")?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let err_tx = line_tx.clone();
    tokio::spawn(forward_lines(stdout, line_tx));
    tokio::spawn(forward_lines(stderr, err_tx));

    let mut log = OpenOptions::new().append(true).open(&job.log_path).await?;
    while let Some(line) = line_rx.recv().await {
        log.write_all(line.as_bytes()).await?;
        log.write_all(b"\n").await?;
        log.flush().await?;
    }

    let status = child.wait().await?;
    Ok(status)
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Moves everything the external tool left in its data folder into the
/// user's results folder.
async fn relocate_artifacts(artifact_dir: &Path, result_dir: &Path) -> Result<()> {
    match tokio::fs::metadata(artifact_dir).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    tokio::fs::create_dir_all(result_dir).await?;
    let mut entries = tokio::fs::read_dir(artifact_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let target = result_dir.join(entry.file_name());
        tokio::fs::rename(entry.path(), &target).await.with_context(|| {
            format!(
                "failed to move artifact {} to {}",
                entry.path().display(),
                target.display()
            )
        })?;
    }
    Ok(())
}

pub async fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::command::TrainingInvocation;
    use std::path::PathBuf;

    fn test_dir() -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "tesstrain-web-runner-{}-{timestamp}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn test_job(dir: &Path, program: &str, args: &[&str]) -> TrainingJob {
        let log_path = dir.join("run.log");
        std::fs::write(&log_path, b"").unwrap();
        TrainingJob {
            username: "alice".into(),
            model_name: "eng_v2".into(),
            start_model: None,
            extra_parameters: String::new(),
            ground_truth_dir: dir.join("gt"),
            result_dir: dir.join("results"),
            artifact_dir: dir.join("data"),
            log_path,
            invocation: TrainingInvocation {
                program: program.into(),
                args: args.iter().map(|s| s.to_string()).collect(),
                work_dir: None,
            },
        }
    }

    #[tokio::test]
    async fn successful_run_writes_output_and_completion_marker() {
        let dir = test_dir();
        let coordinator = Arc::new(JobCoordinator::default());
        let job = test_job(&dir, "echo", &["hello", "world"]);
        coordinator.submit(&job.log_path);

        run_training(coordinator.clone(), job.clone()).await;

        let log = std::fs::read_to_string(&job.log_path).unwrap();
        assert!(log.contains("Running: echo hello world"));
        assert!(log.contains("hello world"));
        assert!(log.contains("training exited with status:"));
        assert!(log.contains(&format!(
            "Completed: {}",
            job.log_path.file_name().unwrap().to_string_lossy()
        )));
        assert_eq!(
            coordinator.status_of(&job.log_path),
            Some(TrainingStatus::Completed)
        );
        assert!(!coordinator.has_active());
    }

    #[tokio::test]
    async fn failing_process_leaves_no_completion_marker_and_frees_the_slot() {
        let dir = test_dir();
        let coordinator = Arc::new(JobCoordinator::default());
        let job = test_job(&dir, "false", &[]);
        coordinator.submit(&job.log_path);

        run_training(coordinator.clone(), job.clone()).await;

        let log = std::fs::read_to_string(&job.log_path).unwrap();
        assert!(log.contains("training exited with status:"));
        assert!(!log.contains("Completed:"));
        assert_eq!(
            coordinator.status_of(&job.log_path),
            Some(TrainingStatus::Failed)
        );
        // a new run can acquire the slot
        let ticket = coordinator.try_begin(&job.log_path).unwrap();
        drop(ticket);
    }

    #[tokio::test]
    async fn spawn_failure_is_logged_and_releases_the_slot() {
        let dir = test_dir();
        let coordinator = Arc::new(JobCoordinator::default());
        let job = test_job(&dir, "/nonexistent/trainer-binary", &[]);
        coordinator.submit(&job.log_path);

        run_training(coordinator.clone(), job.clone()).await;

        let log = std::fs::read_to_string(&job.log_path).unwrap();
        assert!(log.contains("Error:"));
        assert!(!log.contains("Completed:"));
        assert_eq!(
            coordinator.status_of(&job.log_path),
            Some(TrainingStatus::Failed)
        );
        assert!(coordinator.try_begin(&job.log_path).is_ok());
    }

    #[tokio::test]
    async fn busy_slot_rejects_the_run_without_touching_the_mutex() {
        let dir = test_dir();
        let coordinator = Arc::new(JobCoordinator::default());
        let holder = dir.join("holder.log");
        coordinator.submit(&holder);
        let ticket = coordinator.try_begin(&holder).unwrap();

        let job = test_job(&dir, "echo", &["never runs"]);
        coordinator.submit(&job.log_path);
        run_training(coordinator.clone(), job.clone()).await;

        let log = std::fs::read_to_string(&job.log_path).unwrap();
        assert!(log.contains("already in progress"));
        assert!(!log.contains("never runs"));
        assert_eq!(
            coordinator.status_of(&job.log_path),
            Some(TrainingStatus::Failed)
        );
        // the first run still owns the slot
        assert!(coordinator.try_begin(&job.log_path).is_err());
        drop(ticket);
    }

    #[tokio::test]
    async fn artifacts_are_relocated_into_the_results_folder() {
        let dir = test_dir();
        let coordinator = Arc::new(JobCoordinator::default());
        let job = test_job(&dir, "true", &[]);
        std::fs::create_dir_all(&job.artifact_dir).unwrap();
        std::fs::write(job.artifact_dir.join("eng_v2.traineddata"), b"model").unwrap();
        coordinator.submit(&job.log_path);

        run_training(coordinator.clone(), job.clone()).await;

        assert!(job.result_dir.join("eng_v2.traineddata").exists());
        assert!(!job.artifact_dir.join("eng_v2.traineddata").exists());
        assert_eq!(
            coordinator.status_of(&job.log_path),
            Some(TrainingStatus::Completed)
        );
    }
}
