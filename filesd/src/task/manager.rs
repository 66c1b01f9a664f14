use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use files_core::ApiError;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{Task, TaskError, TaskInfo, TaskPlan, TaskStatus};
use crate::config::EngineConfig;
use crate::paste::{Backends, PasteError, TaskType};
use crate::storage::{Action, FileParam, PasteParam};

const QUEUE_CAPACITY: usize = 1024;

/// Registry of tasks plus the single worker that executes them in the order
/// they were queued.
pub struct TaskManager {
    tasks: DashMap<String, Arc<Task>>,
    backends: Arc<Backends>,
    queue: mpsc::Sender<Arc<Task>>,
    last_id: AtomicU64,
}

impl TaskManager {
    /// Must be called inside a tokio runtime; the worker is spawned here.
    pub fn new(backends: Arc<Backends>) -> Arc<Self> {
        let (queue, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(worker(rx));
        Arc::new(Self {
            tasks: DashMap::new(),
            backends,
            queue,
            last_id: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: EngineConfig) -> Result<Arc<Self>, ApiError> {
        Ok(Self::new(Arc::new(Backends::new(config)?)))
    }

    pub fn backends(&self) -> &Arc<Backends> {
        &self.backends
    }

    /// Nanosecond timestamp, bumped when two tasks land in the same tick.
    fn next_id(&self) -> String {
        let now = OffsetDateTime::now_utc().unix_timestamp_nanos().max(0) as u64;
        let mut last = self.last_id.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last_id
                .compare_exchange(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next.to_string(),
                Err(actual) => last = actual,
            }
        }
    }

    fn register(&self, plan: TaskPlan) -> Arc<Task> {
        let id = self.next_id();
        let task = Arc::new(Task::new(
            id.clone(),
            plan,
            self.backends.clone(),
            self.queue.clone(),
        ));
        info!(task_id = %id, task_type = task.task_type().as_str(), "task created");
        self.tasks.insert(id, task.clone());
        task
    }

    /// Validates a copy or move and picks how it will run. The task stays
    /// pending until [`Task::run`] queues it.
    pub fn create_task(&self, param: PasteParam) -> Result<Arc<Task>, TaskError> {
        let PasteParam {
            owner,
            action,
            mut src,
            mut dst,
        } = param;
        if src.path.trim_matches('/').is_empty() {
            return Err(PasteError::Invalid("cannot paste a root folder".to_string()).into());
        }
        src.owner = owner.clone();
        dst.owner = owner.clone();
        if !dst.is_dir() {
            dst.path.push('/');
        }
        if action == Action::Move && src.same_backend(&dst) && src.parent_path() == dst.path {
            return Err(PasteError::Invalid(format!("{src} is already in {}", dst.path)).into());
        }

        let task_type = TaskType::classify(
            self.backends.locator(),
            &PasteParam {
                owner,
                action,
                src: src.clone(),
                dst: dst.clone(),
            },
        )?;
        Ok(self.register(TaskPlan {
            action,
            task_type,
            sources: vec![src.clone()],
            src,
            dst,
        }))
    }

    /// Packs `sources` into the archive at `output`; the format follows the
    /// output's extension.
    pub fn create_compress_task(
        &self,
        owner: &str,
        sources: Vec<FileParam>,
        output: FileParam,
    ) -> Result<Arc<Task>, TaskError> {
        let mut sources = sources;
        for source in &mut sources {
            source.owner = owner.to_string();
        }
        let Some(first) = sources.first().cloned() else {
            return Err(PasteError::Invalid("nothing to compress".to_string()).into());
        };
        if output.is_dir() {
            return Err(PasteError::Invalid(format!("{output} names a folder, not an archive")).into());
        }
        for param in sources.iter().chain(std::iter::once(&output)) {
            if !self.backends.locator().is_local_node(param) {
                return Err(PasteError::Unsupported(format!(
                    "{param} is not on this node's filesystem"
                ))
                .into());
            }
        }
        Ok(self.register(TaskPlan {
            action: Action::Copy,
            task_type: TaskType::Compress,
            src: first,
            sources,
            dst: FileParam {
                owner: owner.to_string(),
                ..output
            },
        }))
    }

    /// Extracts `archive` into the folder `dest`.
    pub fn create_uncompress_task(
        &self,
        owner: &str,
        archive: FileParam,
        dest: FileParam,
        overwrite: bool,
    ) -> Result<Arc<Task>, TaskError> {
        let archive = FileParam {
            owner: owner.to_string(),
            ..archive
        };
        let mut dest = FileParam {
            owner: owner.to_string(),
            ..dest
        };
        if !dest.is_dir() {
            dest.path.push('/');
        }
        for param in [&archive, &dest] {
            if !self.backends.locator().is_local_node(param) {
                return Err(PasteError::Unsupported(format!(
                    "{param} is not on this node's filesystem"
                ))
                .into());
            }
        }
        Ok(self.register(TaskPlan {
            action: Action::Copy,
            task_type: TaskType::Uncompress { overwrite },
            sources: vec![archive.clone()],
            src: archive,
            dst: dest,
        }))
    }

    pub fn task(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.get(id).map(|entry| entry.value().clone())
    }

    fn require(&self, id: &str) -> Result<Arc<Task>, TaskError> {
        self.task(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub fn run(&self, id: &str) -> Result<(), TaskError> {
        self.require(id)?.run()
    }

    pub fn get_task(&self, id: &str) -> Option<TaskInfo> {
        self.task(id).map(|task| task.info())
    }

    /// Every known task, oldest first.
    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self.tasks.iter().map(|entry| entry.value().info()).collect();
        tasks.sort_by_key(|info| info.id.parse::<u64>().unwrap_or(u64::MAX));
        tasks
    }

    /// Stops a task for good. Cancelling a finished task does nothing.
    pub async fn cancel_task(&self, id: &str) -> Result<(), TaskError> {
        let task = self.require(id)?;
        match task.status() {
            status if status.is_terminal() => {
                debug!(task_id = %id, status = %status, "cancel ignored for finished task");
            }
            TaskStatus::Paused => task.discard_paused().await,
            TaskStatus::Pending => task.cancel_unstarted(),
            TaskStatus::Running => task.cancel(),
            _ => {}
        }
        info!(task_id = %id, "task cancel requested");
        Ok(())
    }

    /// Asks a running task to stop at its next checkpoint so it can be
    /// resumed later.
    pub fn pause_task(&self, id: &str) -> Result<(), TaskError> {
        let task = self.require(id)?;
        if !task.supports_pause() {
            return Err(TaskError::PauseUnsupported(id.to_string()));
        }
        match task.status() {
            TaskStatus::Running => {}
            TaskStatus::Pending if task.is_queued() => {}
            _ => return Err(TaskError::NotRunning(id.to_string())),
        }
        task.request_pause();
        info!(task_id = %id, "task pause requested");
        Ok(())
    }

    pub fn resume_task(&self, id: &str) -> Result<(), TaskError> {
        let task = self.require(id)?;
        if task.status() != TaskStatus::Paused {
            return Err(TaskError::NotPaused(id.to_string()));
        }
        task.run()?;
        info!(task_id = %id, "task resumed");
        Ok(())
    }

    /// Forgets a task. A task that is still active is cancelled first.
    pub async fn remove_task(&self, id: &str) -> Option<TaskInfo> {
        let task = self.task(id)?;
        if !task.status().is_terminal() {
            if let Err(err) = self.cancel_task(id).await {
                debug!(task_id = %id, error = %err, "cancel before removal failed");
            }
        }
        self.tasks.remove(id).map(|(_, task)| task.info())
    }
}

async fn worker(mut rx: mpsc::Receiver<Arc<Task>>) {
    while let Some(task) = rx.recv().await {
        let id = task.id().to_string();
        debug!(task_id = %id, "worker picked up task");
        if let Err(err) = tokio::spawn(task.clone().execute()).await {
            error!(task_id = %id, error = %err, "task worker panicked");
            task.fail(format!("task aborted: {err}"));
        }
    }
    debug!("task worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::storage::FileType;

    fn manager(root: &std::path::Path) -> Arc<TaskManager> {
        let mut config = EngineConfig::for_roots("node-a", &root.join("drive"), &root.join("cache"));
        config.disk_usage_ceiling = None;
        config.use_rsync = false;
        TaskManager::from_config(config).unwrap()
    }

    fn drive(path: &str) -> FileParam {
        FileParam::new("alice", FileType::Drive, "node-a", path)
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let ids: Vec<u64> = (0..50).map(|_| manager.next_id().parse().unwrap()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test]
    async fn create_task_normalizes_destination_folder() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let task = manager
            .create_task(PasteParam {
                owner: "alice".into(),
                action: Action::Copy,
                src: drive("/a.txt"),
                dst: drive("/Backup"),
            })
            .unwrap();
        let info = task.info();
        assert_eq!(info.dst, "/Backup/");
        assert_eq!(info.status, TaskStatus::Pending);
        assert_eq!(info.task_type, "rsync");
    }

    #[tokio::test]
    async fn rejects_root_and_same_folder_move() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let root = manager.create_task(PasteParam {
            owner: "alice".into(),
            action: Action::Copy,
            src: drive("/"),
            dst: drive("/Backup/"),
        });
        assert!(matches!(root, Err(TaskError::Paste(PasteError::Invalid(_)))));

        let same = manager.create_task(PasteParam {
            owner: "alice".into(),
            action: Action::Move,
            src: drive("/Docs/a.txt"),
            dst: drive("/Docs/"),
        });
        assert!(matches!(same, Err(TaskError::Paste(PasteError::Invalid(_)))));
    }

    #[tokio::test]
    async fn unknown_ids_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        assert!(manager.get_task("42").is_none());
        assert!(matches!(manager.run("42"), Err(TaskError::NotFound(_))));
        assert!(matches!(manager.cancel_task("42").await, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn pending_task_cancels_immediately_and_cannot_run() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let task = manager
            .create_task(PasteParam {
                owner: "alice".into(),
                action: Action::Copy,
                src: drive("/a.txt"),
                dst: drive("/Backup/"),
            })
            .unwrap();
        manager.cancel_task(task.id()).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(matches!(task.run(), Err(TaskError::Finished { .. })));
        // Cancelling again is a no-op.
        manager.cancel_task(task.id()).await.unwrap();
    }

    #[rstest]
    #[case(TaskStatus::Running)]
    #[case(TaskStatus::Completed)]
    #[case(TaskStatus::Failed)]
    #[tokio::test]
    async fn late_pending_cancel_keeps_the_worker_status(#[case] reached: TaskStatus) {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let task = manager
            .create_task(PasteParam {
                owner: "alice".into(),
                action: Action::Copy,
                src: drive("/a.txt"),
                dst: drive("/Backup/"),
            })
            .unwrap();
        // The worker moved the task on after the caller last saw `Pending`.
        task.state.lock().status = reached;
        task.cancel_unstarted();

        assert_eq!(task.status(), reached);
        let control = task.control();
        assert!(control.canceled);
        assert!(control.token.is_cancelled());
    }

    #[tokio::test]
    async fn queued_task_cancelled_before_pickup_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("drive/alice");
        std::fs::create_dir_all(home.join("Backup")).unwrap();
        std::fs::write(home.join("a.txt"), b"x").unwrap();
        let manager = manager(dir.path());
        let task = manager
            .create_task(PasteParam {
                owner: "alice".into(),
                action: Action::Copy,
                src: drive("/a.txt"),
                dst: drive("/Backup/"),
            })
            .unwrap();
        task.cancel_unstarted();
        task.clone().execute().await;

        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(!home.join("Backup/a.txt").exists());
    }

    #[tokio::test]
    async fn pause_requires_support() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let rsync = manager
            .create_task(PasteParam {
                owner: "alice".into(),
                action: Action::Copy,
                src: drive("/a.txt"),
                dst: drive("/Backup/"),
            })
            .unwrap();
        assert!(matches!(
            manager.pause_task(rsync.id()),
            Err(TaskError::PauseUnsupported(_))
        ));

        let tar = manager
            .create_compress_task("alice", vec![drive("/Docs/")], drive("/out.tar.gz"))
            .unwrap();
        assert!(!tar.supports_pause());
        let zip = manager
            .create_compress_task("alice", vec![drive("/Docs/")], drive("/out.zip"))
            .unwrap();
        assert!(zip.supports_pause());
        assert!(matches!(
            manager.pause_task(zip.id()),
            Err(TaskError::NotRunning(_))
        ));
        assert!(matches!(
            manager.resume_task(zip.id()),
            Err(TaskError::NotPaused(_))
        ));
    }

    #[tokio::test]
    async fn list_and_remove_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let first = manager
            .create_compress_task("alice", vec![drive("/Docs/")], drive("/a.zip"))
            .unwrap();
        let second = manager
            .create_uncompress_task("alice", drive("/a.zip"), drive("/out"), false)
            .unwrap();
        let ids: Vec<String> = manager.list_tasks().into_iter().map(|info| info.id).collect();
        assert_eq!(ids, vec![first.id().to_string(), second.id().to_string()]);

        let removed = manager.remove_task(first.id()).await.unwrap();
        assert_eq!(removed.status, TaskStatus::Cancelled);
        assert_eq!(manager.list_tasks().len(), 1);
        assert_eq!(second.info().dst, "/out/");
    }

    #[tokio::test]
    async fn compress_rejects_remote_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let remote = FileParam::new("alice", FileType::Drive, "node-b", "/Docs/");
        assert!(matches!(
            manager.create_compress_task("alice", vec![remote], drive("/a.zip")),
            Err(TaskError::Paste(PasteError::Unsupported(_)))
        ));
        assert!(matches!(
            manager.create_compress_task("alice", Vec::new(), drive("/a.zip")),
            Err(TaskError::Paste(PasteError::Invalid(_)))
        ));
    }
}
