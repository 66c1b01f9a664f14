//! Tasks and the manager that queues them onto a single worker.

mod manager;
mod phase;
mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use manager::TaskManager;
pub use phase::{blend_bytes, blend_percent};
pub use state::TaskStatus;
pub(crate) use state::TaskState;

use crate::compress::ArchiveFormat;
use crate::paste::{
    Backends, PasteError, PhaseContext, PhaseSetup, TaskType, handler_for, remove_entry,
    remove_local,
};
use crate::storage::{Action, FileParam, FileType};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("task {0} is already queued or running")]
    AlreadyRunning(String),
    #[error("task {id} is already {status}")]
    Finished { id: String, status: TaskStatus },
    #[error("task pool is not accepting work")]
    PoolRejected,
    #[error("task {0} cannot be paused")]
    PauseUnsupported(String),
    #[error("task {0} is not running")]
    NotRunning(String),
    #[error("task {0} is not paused")]
    NotPaused(String),
    #[error(transparent)]
    Paste(#[from] PasteError),
}

/// Point-in-time view of a task for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub action: Action,
    pub is_dir: bool,
    pub file_name: String,
    pub dst: String,
    pub dst_path: String,
    pub dst_file_type: FileType,
    pub src: String,
    pub src_file_type: FileType,
    pub progress: u8,
    pub transferred: u64,
    pub total_file_size: u64,
    pub status: TaskStatus,
    pub error_message: String,
    pub task_type: String,
    pub current_phase: usize,
    pub total_phases: usize,
}

/// What a task was created to do.
#[derive(Debug, Clone)]
pub(crate) struct TaskPlan {
    pub action: Action,
    pub task_type: TaskType,
    pub src: FileParam,
    pub sources: Vec<FileParam>,
    pub dst: FileParam,
}

#[derive(Debug)]
struct TaskControl {
    token: CancellationToken,
    canceled: bool,
    queued: bool,
}

/// One unit of work. Created by [`TaskManager`], executed by its worker one
/// phase after another.
pub struct Task {
    id: String,
    plan: TaskPlan,
    legs: Vec<TaskType>,
    backends: Arc<Backends>,
    state: Arc<TaskState>,
    control: Mutex<TaskControl>,
    pool: mpsc::Sender<Arc<Task>>,
}

impl Task {
    pub(crate) fn new(
        id: String,
        plan: TaskPlan,
        backends: Arc<Backends>,
        pool: mpsc::Sender<Arc<Task>>,
    ) -> Self {
        let legs = plan.task_type.legs();
        Self {
            id,
            state: Arc::new(TaskState::new(legs.len())),
            legs,
            plan,
            backends,
            control: Mutex::new(TaskControl {
                token: CancellationToken::new(),
                canceled: false,
                queued: false,
            }),
            pool,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.plan.task_type
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    fn control(&self) -> MutexGuard<'_, TaskControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues the task on the worker pool. Running a paused task resumes it.
    pub fn run(self: &Arc<Self>) -> Result<(), TaskError> {
        {
            let mut control = self.control();
            let status = self.status();
            if status.is_terminal() {
                return Err(TaskError::Finished {
                    id: self.id.clone(),
                    status,
                });
            }
            if control.queued || status == TaskStatus::Running {
                return Err(TaskError::AlreadyRunning(self.id.clone()));
            }
            if control.token.is_cancelled() {
                control.token = CancellationToken::new();
            }
            control.queued = true;
            self.state.set_pause_requested(false);
            self.state.lock().status = TaskStatus::Pending;
        }

        if self.pool.try_send(self.clone()).is_err() {
            self.control().queued = false;
            return Err(TaskError::PoolRejected);
        }
        debug!(task_id = %self.id, "task queued");
        Ok(())
    }

    pub fn supports_pause(&self) -> bool {
        if !self.plan.task_type.supports_pause() {
            return false;
        }
        if self.plan.task_type == TaskType::Compress {
            return ArchiveFormat::from_path(std::path::Path::new(&self.plan.dst.path))
                .is_some_and(|format| format.supports_pause());
        }
        true
    }

    /// Cancels the token and remembers that the stop is final.
    pub(crate) fn cancel(&self) {
        let mut control = self.control();
        control.canceled = true;
        self.state.set_pause_requested(false);
        control.token.cancel();
    }

    pub(crate) fn request_pause(&self) {
        let control = self.control();
        self.state.set_pause_requested(true);
        control.token.cancel();
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.control().queued
    }

    /// Cancels a task that has not started yet. The status only changes
    /// while it is still `Pending`; once the worker has taken the task, the
    /// cancelled token ends the run and the worker publishes the outcome.
    pub(crate) fn cancel_unstarted(&self) {
        let mut control = self.control();
        control.canceled = true;
        self.state.set_pause_requested(false);
        control.token.cancel();
        let mut record = self.state.lock();
        if record.status == TaskStatus::Pending {
            record.status = TaskStatus::Cancelled;
            record.message = "task cancelled".to_string();
        }
    }

    pub(crate) fn fail(&self, message: String) {
        let mut record = self.state.lock();
        record.status = TaskStatus::Failed;
        record.message = message;
    }

    /// Cancels a paused task and throws away what it had written so far.
    pub(crate) async fn discard_paused(&self) {
        self.cancel();
        let paused = self.state.lock().paused_param.clone();
        if let Some(param) = paused {
            if let Err(err) = remove_entry(&self.backends, &param).await {
                warn!(task_id = %self.id, entry = %param, error = %err, "failed to remove paused output");
            }
        }
        self.release().await;
        let mut record = self.state.lock();
        record.status = TaskStatus::Cancelled;
        record.message = "task cancelled".to_string();
    }

    /// Worker entry point.
    pub(crate) async fn execute(self: Arc<Self>) {
        // Leaving `Pending` happens under the control lock so a concurrent
        // cancel sees either a queued task or a started one.
        let token = {
            let mut control = self.control();
            control.queued = false;
            if control.canceled {
                let mut record = self.state.lock();
                record.status = TaskStatus::Cancelled;
                record.message = "task cancelled".to_string();
                return;
            }
            if control.token.is_cancelled() && self.state.pause_requested() {
                drop(control);
                self.mark_paused();
                return;
            }
            self.state.lock().status = TaskStatus::Running;
            control.token.clone()
        };
        info!(task_id = %self.id, task_type = self.plan.task_type.as_str(), src = %self.plan.src, dst = %self.plan.dst, "task started");
        let result = self.run_phases(&token).await;
        self.settle(result, &token).await;
    }

    fn mark_paused(&self) {
        let mut record = self.state.lock();
        record.status = TaskStatus::Paused;
        record.was_paused = true;
        info!(task_id = %self.id, phase = record.current_phase, "task paused");
    }

    /// Publishes the outcome of a run. Terminal states release staging and
    /// upload bookkeeping before the status becomes visible.
    async fn settle(&self, result: Result<(), PasteError>, token: &CancellationToken) {
        let canceled = self.control().canceled;
        let (status, message) = match result {
            Ok(()) => (TaskStatus::Completed, String::new()),
            Err(err)
                if !canceled
                    && token.is_cancelled()
                    && self.state.pause_requested()
                    && err.is_interruption() =>
            {
                self.mark_paused();
                return;
            }
            Err(err) if canceled || matches!(err, PasteError::Cancelled) => {
                (TaskStatus::Cancelled, "task cancelled".to_string())
            }
            Err(err) => {
                warn!(task_id = %self.id, error = %err, "task failed");
                (TaskStatus::Failed, err.to_string())
            }
        };
        self.release().await;

        let mut record = self.state.lock();
        if status == TaskStatus::Completed {
            record.progress = 100;
            record.transferred = record.total_size;
            info!(task_id = %self.id, bytes = record.total_size, "task completed");
        } else if status == TaskStatus::Cancelled {
            info!(task_id = %self.id, "task cancelled");
        }
        record.status = status;
        record.message = message;
    }

    /// Frees what a terminal task no longer needs: staging folders and
    /// upload bookkeeping.
    async fn release(&self) {
        let tidy = std::mem::take(&mut self.state.lock().tidy_dirs);
        for dir in tidy {
            if let Err(err) = remove_local(&dir).await {
                warn!(task_id = %self.id, path = %dir.display(), error = %err, "failed to remove staging folder");
            }
        }
        self.backends.uploads().forget_task(&self.id);
    }

    async fn run_phases(&self, token: &CancellationToken) -> Result<(), PasteError> {
        let total = self.legs.len();
        let (start, mut src) = {
            let record = self.state.lock();
            let start = record.current_phase.min(total.saturating_sub(1));
            let src = match start.checked_sub(1) {
                Some(prev) => record
                    .phase_outputs
                    .get(prev)
                    .cloned()
                    .unwrap_or_else(|| self.plan.src.clone()),
                None => self.plan.src.clone(),
            };
            (start, src)
        };

        let staging = if total > 1 {
            let staging = self
                .backends
                .locator()
                .staging_param(&self.plan.src.owner, &self.id);
            let path = self.backends.locator().local_path(&staging)?;
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| PasteError::io(&path, err))?;
            let mut record = self.state.lock();
            if !record.tidy_dirs.contains(&path) {
                record.tidy_dirs.push(path);
            }
            Some(staging)
        } else {
            None
        };

        let mut consumed = false;
        for phase in start..total {
            let leg = self.legs[phase];
            let final_phase = phase + 1 == total;
            let dst = match (&staging, final_phase) {
                (Some(staging), false) => staging.clone(),
                _ => self.plan.dst.clone(),
            };
            {
                let mut record = self.state.lock();
                record.current_phase = phase;
                record.prev_param = Some(src.clone());
                record.next_param = Some(dst.clone());
            }
            let handler = handler_for(leg)?;
            let sources = if phase == 0 {
                self.plan.sources.clone()
            } else {
                vec![src.clone()]
            };
            let ctx = PhaseContext::new(PhaseSetup {
                task_id: self.id.clone(),
                action: if total > 1 { Action::Copy } else { self.plan.action },
                kind: leg,
                src: src.clone(),
                sources,
                dst,
                phase,
                total_phases: total,
                cancel: token.clone(),
                backends: self.backends.clone(),
                state: self.state.clone(),
            });
            debug!(task_id = %self.id, phase, total_phases = total, leg = leg.as_str(), "phase started");
            let outcome = handler.execute(&ctx).await?;

            let mut record = self.state.lock();
            record.phase_outputs.truncate(phase);
            record.phase_outputs.push(outcome.output.clone());
            record.paused_param = None;
            record.paused_phase = None;
            if final_phase {
                record.resolved = Some(outcome.output.clone());
            }
            drop(record);
            consumed = outcome.source_consumed;
            src = outcome.output;
        }

        if self.plan.action == Action::Move && (total > 1 || !consumed) {
            remove_entry(&self.backends, &self.plan.src).await?;
            info!(task_id = %self.id, src = %self.plan.src, "source removed after move");
        }
        Ok(())
    }

    pub fn info(&self) -> TaskInfo {
        let record = self.state.snapshot();
        let resolved = record.resolved.as_ref();
        let file_name = resolved
            .map(|param| param.name().to_string())
            .unwrap_or_else(|| self.plan.src.name().to_string());
        TaskInfo {
            id: self.id.clone(),
            action: self.plan.action,
            is_dir: self.plan.src.is_dir(),
            file_name,
            dst: self.plan.dst.path.clone(),
            dst_path: resolved
                .map(|param| param.path.clone())
                .unwrap_or_else(|| self.plan.dst.path.clone()),
            dst_file_type: self.plan.dst.file_type,
            src: self.plan.src.path.clone(),
            src_file_type: self.plan.src.file_type,
            progress: record.progress,
            transferred: record.transferred.min(record.total_size),
            total_file_size: record.total_size,
            status: record.status,
            error_message: record.message,
            task_type: self.plan.task_type.as_str().to_string(),
            current_phase: record.current_phase,
            total_phases: record.total_phases,
        }
    }
}
