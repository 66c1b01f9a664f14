use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::phase::{blend_bytes, blend_percent};
use crate::compress::Checkpoint;
use crate::storage::FileParam;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a task. Written by the worker running the task; read by
/// status snapshots.
#[derive(Debug, Clone)]
pub(crate) struct TaskRecord {
    pub status: TaskStatus,
    pub message: String,
    pub progress: u8,
    pub transferred: u64,
    pub total_size: u64,
    pub current_phase: usize,
    pub total_phases: usize,
    /// Input of the current phase.
    pub prev_param: Option<FileParam>,
    /// Output directory of the current phase.
    pub next_param: Option<FileParam>,
    /// Destination entry picked by the phase that was paused.
    pub paused_param: Option<FileParam>,
    pub paused_phase: Option<usize>,
    pub was_paused: bool,
    /// Where each finished phase left the item.
    pub phase_outputs: Vec<FileParam>,
    /// Final destination entry once known.
    pub resolved: Option<FileParam>,
    pub checkpoint: Option<Checkpoint>,
    pub tidy_dirs: Vec<PathBuf>,
}

impl TaskRecord {
    fn new(total_phases: usize) -> Self {
        Self {
            status: TaskStatus::Pending,
            message: String::new(),
            progress: 0,
            transferred: 0,
            total_size: 0,
            current_phase: 0,
            total_phases,
            prev_param: None,
            next_param: None,
            paused_param: None,
            paused_phase: None,
            was_paused: false,
            phase_outputs: Vec::new(),
            resolved: None,
            checkpoint: None,
            tidy_dirs: Vec::new(),
        }
    }
}

/// Record plus the pause flag, shared between the task, its phases and the
/// manager.
#[derive(Debug)]
pub(crate) struct TaskState {
    record: Mutex<TaskRecord>,
    pause: Arc<AtomicBool>,
}

impl TaskState {
    pub(crate) fn new(total_phases: usize) -> Self {
        Self {
            record: Mutex::new(TaskRecord::new(total_phases)),
            pause: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TaskRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> TaskRecord {
        self.lock().clone()
    }

    pub(crate) fn pause_flag(&self) -> Arc<AtomicBool> {
        self.pause.clone()
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pause_requested(&self, value: bool) {
        self.pause.store(value, Ordering::SeqCst);
    }

    /// Folds the byte counters of one phase into the task's totals. Progress
    /// only moves forward and stays below 100 until the task completes.
    pub(crate) fn report(&self, phase: usize, done: u64, phase_total: u64) {
        let mut record = self.lock();
        record.total_size = record.total_size.max(phase_total);
        let local = if phase_total == 0 {
            0
        } else {
            (u128::from(done.min(phase_total)) * 100 / u128::from(phase_total)) as u8
        };
        let percent = blend_percent(phase, record.total_phases, local).min(99);
        record.progress = record.progress.max(percent);
        let bytes = blend_bytes(
            phase,
            record.total_phases,
            done,
            phase_total,
            record.total_size,
        );
        record.transferred = record.transferred.max(bytes).min(record.total_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_is_monotonic_and_clamped() {
        let state = TaskState::new(2);
        state.report(0, 50, 100);
        assert_eq!(state.snapshot().progress, 25);
        state.report(0, 20, 100);
        assert_eq!(state.snapshot().progress, 25);
        state.report(1, 100, 100);
        let record = state.snapshot();
        assert_eq!(record.progress, 99);
        assert_eq!(record.transferred, 100);
        assert!(record.transferred <= record.total_size);
    }
}
