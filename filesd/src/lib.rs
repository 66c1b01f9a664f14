//! Paste/transfer task engine: copies and moves between this node's
//! filesystem, peer nodes, a sync service and cloud drives, plus archive
//! compression and extraction, run as pausable tasks on a single worker.

pub mod cleanup;
pub mod compress;
pub mod config;
pub mod paste;
pub mod storage;
pub mod task;

pub use config::EngineConfig;
pub use paste::{PasteError, TaskType};
pub use storage::{Action, FileParam, FileType, PasteParam};
pub use task::{Task, TaskError, TaskInfo, TaskManager, TaskStatus};
