//! Feedback stream: status snapshots, execution events and active-task deltas

pub mod progress;

use crate::status::{StatusManager, StatusSnapshot, TaskIndex};
use crate::targets::Target;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

pub use progress::ProgressDisplay;

/// One streamed response message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResponse {
    #[serde(flatten)]
    pub status: StatusSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_result: Option<ExecEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task: Option<ActiveTaskDelta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecEventKind {
    Log,
    Result,
}

/// Event forwarded from the plugin execution collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecEvent {
    pub kind: ExecEventKind,
    pub level: String,
    pub message: String,
    pub task_index: TaskIndex,
    pub plugin_name: String,
    pub target_url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveTaskOp {
    Create,
    Remove,
}

/// Live active-task table update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTaskDelta {
    pub operator: ActiveTaskOp,
    pub index: TaskIndex,
    pub url: String,
    pub is_https: bool,
    pub request: Vec<u8>,
    pub plugin_name: String,
}

impl ActiveTaskDelta {
    pub fn new(operator: ActiveTaskOp, index: TaskIndex, target: &Target, plugin_name: &str) -> Self {
        Self {
            operator,
            index,
            url: target.url.clone(),
            is_https: target.is_https,
            request: target.request.clone(),
            plugin_name: plugin_name.to_string(),
        }
    }
}

/// Sends responses to the caller; every message carries a fresh snapshot
#[derive(Clone)]
pub struct Feedback {
    sender: mpsc::UnboundedSender<ScanResponse>,
    status: Arc<StatusManager>,
}

impl Feedback {
    pub fn new(sender: mpsc::UnboundedSender<ScanResponse>, status: Arc<StatusManager>) -> Self {
        Self { sender, status }
    }

    pub fn status_manager(&self) -> &Arc<StatusManager> {
        &self.status
    }

    /// Plain status update
    pub fn status(&self) {
        self.send(None, None);
    }

    pub fn event(&self, event: ExecEvent) {
        self.send(Some(event), None);
    }

    pub fn active(&self, delta: ActiveTaskDelta) {
        self.send(None, Some(delta));
    }

    fn send(&self, exec_result: Option<ExecEvent>, active_task: Option<ActiveTaskDelta>) {
        let response = ScanResponse {
            status: self.status.get_status(),
            exec_result,
            active_task,
        };
        if self.sender.send(response).is_err() {
            debug!("Feedback receiver for task {} dropped", self.status.task_id());
        }
    }
}

/// Per-task handle a plugin executor reports through
#[derive(Clone)]
pub struct ResultSink {
    feedback: Feedback,
    task_index: TaskIndex,
    plugin_name: String,
    target_url: String,
}

impl ResultSink {
    pub fn new(feedback: Feedback, task_index: TaskIndex, plugin_name: &str, target_url: &str) -> Self {
        Self {
            feedback,
            task_index,
            plugin_name: plugin_name.to_string(),
            target_url: target_url.to_string(),
        }
    }

    pub fn task_index(&self) -> TaskIndex {
        self.task_index
    }

    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.emit(ExecEventKind::Log, level, message.into());
    }

    /// Report a finding
    pub fn result(&self, message: impl Into<String>) {
        self.emit(ExecEventKind::Result, "info", message.into());
    }

    fn emit(&self, kind: ExecEventKind, level: &str, message: String) {
        self.feedback.event(ExecEvent {
            kind,
            level: level.to_string(),
            message,
            task_index: self.task_index,
            plugin_name: self.plugin_name.clone(),
            target_url: self.target_url.clone(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_events_carry_snapshot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let status = Arc::new(StatusManager::new("task-x", 1, 2));
        let feedback = Feedback::new(tx, Arc::clone(&status));

        let index = status.do_active_task();
        let sink = ResultSink::new(feedback.clone(), index, "sqli", "http://a/");
        sink.log("warn", "slow response");
        sink.result("possible injection in id");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.status.active_tasks, 1);
        let event = first.exec_result.unwrap();
        assert_eq!(event.kind, ExecEventKind::Log);
        assert_eq!(event.task_index, index);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.exec_result.unwrap().kind, ExecEventKind::Result);
    }

    #[test]
    fn test_response_json_shape() {
        let status = StatusManager::new("task-y", 2, 3);
        let target = Target::new("http://a/", false, b"GET / HTTP/1.1\r\n\r\n".to_vec());
        let response = ScanResponse {
            status: status.get_status(),
            exec_result: None,
            active_task: Some(ActiveTaskDelta::new(ActiveTaskOp::Create, 1, &target, "p")),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["total_tasks"], 6);
        assert_eq!(json["active_task"]["operator"], "create");
        assert!(json.get("exec_result").is_none());
    }

    #[test]
    fn test_send_after_receiver_drop_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let feedback = Feedback::new(tx, Arc::new(StatusManager::new("gone", 1, 1)));
        feedback.status();
    }
}
