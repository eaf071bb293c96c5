//! Control-plane messages

use crate::config::ScanConfig;
use serde::{Deserialize, Serialize};

/// Control message on a scan stream.
///
/// The first message of a stream must be `New` or `Resume`; `Pause` and
/// `Stop` are follow-ups against the task the stream is driving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ScanCommand {
    New(ScanConfig),
    Resume { task_id: String },
    Pause,
    Stop,
}

impl ScanCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ScanCommand::New(_) => "new",
            ScanCommand::Resume { .. } => "resume",
            ScanCommand::Pause => "pause",
            ScanCommand::Stop => "stop",
        }
    }

    /// Commands allowed to open a stream
    pub fn is_opening(&self) -> bool {
        match self {
            ScanCommand::New(_) | ScanCommand::Resume { .. } => true,
            ScanCommand::Pause | ScanCommand::Stop => false,
        }
    }
}
