pub mod command;
pub mod runner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_derive::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::training::command::TrainingInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrainingStatus::Completed | TrainingStatus::Failed)
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("a training run is already in progress")]
    JobAlreadyRunning,
}

/// One accepted training submission. Not persisted anywhere; the log file
/// on disk is the durable record of the run.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub username: String,
    pub model_name: String,
    pub start_model: Option<String>,
    pub extra_parameters: String,
    pub ground_truth_dir: PathBuf,
    pub result_dir: PathBuf,
    pub artifact_dir: PathBuf,
    pub log_path: PathBuf,
    pub invocation: TrainingInvocation,
}

/// Single-slot coordinator: at most one training run may hold the slot at
/// any instant, across all users. Acquisition is a single atomic operation
/// on the semaphore, and release happens in `RunTicket::drop` no matter how
/// the run ends. Runs are tracked from submission to their terminal state,
/// keyed by log path.
pub struct JobCoordinator {
    slot: Arc<Semaphore>,
    jobs: Mutex<HashMap<PathBuf, TrainingStatus>>,
}

impl Default for JobCoordinator {
    fn default() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl JobCoordinator {
    /// Records an accepted submission before its runner task starts, so a
    /// streaming client connecting right after the acknowledgment never
    /// observes the system as idle.
    pub fn submit(&self, log_path: &Path) {
        let mut jobs = self.jobs.lock().expect("job table poisoned");
        jobs.retain(|_, status| !status.is_terminal());
        jobs.insert(log_path.to_path_buf(), TrainingStatus::Pending);
    }

    pub fn try_begin(self: &Arc<Self>, log_path: &Path) -> Result<RunTicket, TrainingError> {
        let permit = match self.slot.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(TrainingError::JobAlreadyRunning),
            Err(TryAcquireError::Closed) => unreachable!("job slot semaphore is never closed"),
        };
        self.mark(log_path, TrainingStatus::Running);
        Ok(RunTicket {
            coordinator: Arc::clone(self),
            log_path: log_path.to_path_buf(),
            outcome: TrainingStatus::Failed,
            _permit: permit,
        })
    }

    /// True while any submitted run has not yet reached a terminal state.
    pub fn has_active(&self) -> bool {
        self.jobs
            .lock()
            .expect("job table poisoned")
            .values()
            .any(|status| !status.is_terminal())
    }

    pub fn status_of(&self, log_path: &Path) -> Option<TrainingStatus> {
        self.jobs
            .lock()
            .expect("job table poisoned")
            .get(log_path)
            .copied()
    }

    pub(crate) fn mark(&self, log_path: &Path, status: TrainingStatus) {
        self.jobs
            .lock()
            .expect("job table poisoned")
            .insert(log_path.to_path_buf(), status);
    }
}

/// Exclusive right to run one training job. Dropping the ticket records the
/// outcome and frees the slot, so a crashed run can never wedge the system
/// in a permanently-busy state.
pub struct RunTicket {
    coordinator: Arc<JobCoordinator>,
    log_path: PathBuf,
    outcome: TrainingStatus,
    _permit: OwnedSemaphorePermit,
}

impl RunTicket {
    pub fn finish(mut self, outcome: TrainingStatus) {
        self.outcome = outcome;
    }
}

impl Drop for RunTicket {
    fn drop(&mut self) {
        self.coordinator.mark(&self.log_path, self.outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_is_rejected_while_slot_is_held() {
        let coordinator = Arc::new(JobCoordinator::default());
        let first = PathBuf::from("/tmp/a.log");
        let second = PathBuf::from("/tmp/b.log");
        coordinator.submit(&first);
        coordinator.submit(&second);

        let ticket = coordinator.try_begin(&first).unwrap();
        assert!(matches!(
            coordinator.try_begin(&second),
            Err(TrainingError::JobAlreadyRunning)
        ));
        assert_eq!(coordinator.status_of(&first), Some(TrainingStatus::Running));

        // the rejected attempt must not have touched the slot
        drop(ticket);
        let ticket = coordinator.try_begin(&second).unwrap();
        assert_eq!(coordinator.status_of(&second), Some(TrainingStatus::Running));
        drop(ticket);
    }

    #[test]
    fn only_one_of_many_concurrent_begins_wins() {
        let coordinator = Arc::new(JobCoordinator::default());
        let mut tickets = Vec::new();
        for i in 0..16 {
            let log = PathBuf::from(format!("/tmp/{i}.log"));
            coordinator.submit(&log);
            if let Ok(ticket) = coordinator.try_begin(&log) {
                tickets.push(ticket);
            }
        }
        assert_eq!(tickets.len(), 1);
    }

    #[test]
    fn drop_without_finish_records_failure_and_releases() {
        let coordinator = Arc::new(JobCoordinator::default());
        let log = PathBuf::from("/tmp/crashed.log");
        coordinator.submit(&log);
        assert!(coordinator.has_active());

        let ticket = coordinator.try_begin(&log).unwrap();
        drop(ticket);

        assert_eq!(coordinator.status_of(&log), Some(TrainingStatus::Failed));
        assert!(!coordinator.has_active());
        // the slot is free again
        let ticket = coordinator.try_begin(&log).unwrap();
        ticket.finish(TrainingStatus::Completed);
        assert_eq!(coordinator.status_of(&log), Some(TrainingStatus::Completed));
    }

    #[test]
    fn submitted_jobs_count_as_active_before_they_begin() {
        let coordinator = Arc::new(JobCoordinator::default());
        assert!(!coordinator.has_active());

        let log = PathBuf::from("/tmp/pending.log");
        coordinator.submit(&log);
        assert!(coordinator.has_active());
        assert_eq!(coordinator.status_of(&log), Some(TrainingStatus::Pending));

        coordinator.mark(&log, TrainingStatus::Failed);
        assert!(!coordinator.has_active());
    }
}
