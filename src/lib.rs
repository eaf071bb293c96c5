//! Hybridscan - resumable target x plugin scan orchestration
//!
//! Every (target, plugin) pair of a scan is dispatched onto a bounded worker
//! pool, progress is streamed as it happens, and a paused scan can be
//! resumed later under the same task id without re-running finished pairs.

pub mod config;
pub mod error;
pub mod network;
pub mod output;
pub mod plugins;
pub mod scanner;
pub mod status;
pub mod storage;
pub mod targets;
pub mod task;

// Re-export commonly used types
pub use config::{EngineSettings, ScanConfig};
pub use error::{ScanError, ScanResult};
pub use output::{ScanResponse, ProgressDisplay};
pub use plugins::{PluginCatalog, PluginConfig, PluginDescriptor, PluginExecutor, PluginFilter, PluginKind};
pub use scanner::{HybridScanner, RunningTasks};
pub use status::{StatusManager, StatusSnapshot, TaskIndex};
pub use storage::{ScanTaskRecord, TaskStatus, TaskStore};
pub use targets::{Target, TargetGenerator, TargetInput};
pub use task::{ScanCommand, TaskManager};

pub type Result<T> = std::result::Result<T, ScanError>;
