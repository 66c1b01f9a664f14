use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::{Backends, PasteError, TaskType};
use crate::compress::{ArchiveControl, Checkpoint, ProgressFn};
use crate::config::EngineConfig;
use crate::storage::{Action, FileParam, StorageLocator};
use crate::task::TaskState;

/// Inputs of one phase of a task.
pub(crate) struct PhaseSetup {
    pub task_id: String,
    pub action: Action,
    pub kind: TaskType,
    pub src: FileParam,
    pub sources: Vec<FileParam>,
    pub dst: FileParam,
    pub phase: usize,
    pub total_phases: usize,
    pub cancel: CancellationToken,
    pub backends: Arc<Backends>,
    pub state: Arc<TaskState>,
}

/// What a handler sees while running one phase: its endpoints, the shared
/// backends, the cancellation token and a progress sink that feeds the task
/// record. Cheap to clone into spawned helpers.
///
/// `dst` is the directory receiving the item, except for compression where
/// it names the archive to write.
#[derive(Clone)]
pub struct PhaseContext {
    inner: Arc<PhaseInner>,
}

struct PhaseInner {
    setup: PhaseSetup,
    local: Mutex<LocalProgress>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LocalProgress {
    done: u64,
    total: u64,
}

impl PhaseContext {
    pub(crate) fn new(setup: PhaseSetup) -> Self {
        Self {
            inner: Arc::new(PhaseInner {
                setup,
                local: Mutex::new(LocalProgress::default()),
            }),
        }
    }

    fn setup(&self) -> &PhaseSetup {
        &self.inner.setup
    }

    pub fn task_id(&self) -> &str {
        &self.setup().task_id
    }

    pub fn action(&self) -> Action {
        self.setup().action
    }

    pub fn kind(&self) -> TaskType {
        self.setup().kind
    }

    pub fn src(&self) -> &FileParam {
        &self.setup().src
    }

    /// All inputs of a compression; a single-element list otherwise.
    pub fn sources(&self) -> &[FileParam] {
        &self.setup().sources
    }

    pub fn dst(&self) -> &FileParam {
        &self.setup().dst
    }

    pub fn owner(&self) -> &str {
        &self.setup().src.owner
    }

    pub fn phase(&self) -> usize {
        self.setup().phase
    }

    pub fn is_final_phase(&self) -> bool {
        self.setup().phase + 1 >= self.setup().total_phases
    }

    pub fn backends(&self) -> &Backends {
        &self.setup().backends
    }

    pub fn locator(&self) -> &StorageLocator {
        self.setup().backends.locator()
    }

    pub fn config(&self) -> &EngineConfig {
        self.setup().backends.config()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.setup().cancel
    }

    pub fn is_stopped(&self) -> bool {
        self.setup().cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.setup().cancel.cancelled()
    }

    /// Error describing why the token fired.
    pub fn interrupted(&self) -> PasteError {
        if self.setup().state.pause_requested() {
            PasteError::Paused
        } else {
            PasteError::Cancelled
        }
    }

    pub fn check(&self) -> Result<(), PasteError> {
        if self.is_stopped() {
            return Err(self.interrupted());
        }
        Ok(())
    }

    /// Sleeps unless interrupted first.
    pub async fn sleep(&self, delay: Duration) -> Result<(), PasteError> {
        tokio::select! {
            _ = self.cancelled() => Err(self.interrupted()),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    pub fn archive_control(&self) -> ArchiveControl {
        ArchiveControl::with_pause(self.setup().cancel.clone(), self.setup().state.pause_flag())
    }

    /// Progress callback for the compression engine.
    pub fn archive_progress(&self) -> ProgressFn {
        let ctx = self.clone();
        Arc::new(move |_, delta| ctx.add_transferred(delta))
    }

    pub fn set_total(&self, total: u64) {
        self.update(|local| {
            local.total = total;
            local.done = local.done.min(total);
        });
    }

    pub fn add_transferred(&self, delta: u64) {
        self.update(|local| local.done = local.done.saturating_add(delta).min(local.total));
    }

    pub fn set_transferred(&self, done: u64) {
        self.update(|local| local.done = local.done.max(done.min(local.total)));
    }

    pub fn transferred(&self) -> u64 {
        self.inner
            .local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .done
    }

    fn update(&self, apply: impl FnOnce(&mut LocalProgress)) {
        let snapshot = {
            let mut local = self
                .inner
                .local
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            apply(&mut local);
            *local
        };
        self.setup()
            .state
            .report(self.setup().phase, snapshot.done, snapshot.total);
    }

    /// Destination picked by this phase before it was paused, so a resumed
    /// run writes into the same entry instead of generating a new name.
    pub fn resumed_destination(&self) -> Option<FileParam> {
        let record = self.setup().state.lock();
        if record.paused_phase == Some(self.setup().phase) {
            record.paused_param.clone()
        } else {
            None
        }
    }

    pub fn remember_destination(&self, param: &FileParam) {
        let mut record = self.setup().state.lock();
        record.paused_param = Some(param.clone());
        record.paused_phase = Some(self.setup().phase);
        if self.is_final_phase() {
            record.resolved = Some(param.clone());
        }
    }

    pub fn was_paused(&self) -> bool {
        self.setup().state.lock().was_paused
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.setup().state.lock().checkpoint
    }

    pub fn set_checkpoint(&self, checkpoint: Option<Checkpoint>) {
        self.setup().state.lock().checkpoint = checkpoint;
    }
}
