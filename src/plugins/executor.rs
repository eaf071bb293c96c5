//! Plugin execution collaborator
//!
//! The dispatcher only knows the [`PluginExecutor`] contract. The bundled
//! [`ProcessExecutor`] runs a plugin's command as a child process, which is
//! enough to drive external scripts and scanners from the orchestrator.

use super::PluginDescriptor;
use crate::output::ResultSink;
use crate::targets::Target;
use crate::{ScanError, ScanResult};
use async_trait::async_trait;
use log::debug;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Prefix marking a stdout line as a finding rather than a log line
pub const RESULT_PREFIX: &str = "RESULT:";

const MAX_STDERR_BYTES: u64 = 64 * 1024;

/// Runs one plugin against one target
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(
        &self,
        task_id: &str,
        token: CancellationToken,
        target: &Target,
        plugin: &PluginDescriptor,
        proxy: Option<&str>,
        sink: ResultSink,
    ) -> ScanResult<()>;
}

/// Executes plugin commands as child processes.
///
/// Argument placeholders: `{url}`, `{host}`, `{port}`, `{proxy}`, `{task_id}`
/// and `{<var>}` for every target variable. The raw request is written to
/// stdin; stdout lines become log events, `RESULT:` lines become findings.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    extra_env: Vec<(String, String)>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    fn substitute(arg: &str, task_id: &str, target: &Target, proxy: Option<&str>) -> ScanResult<String> {
        let mut result = arg.to_string();
        for (key, value) in &target.vars {
            result = result.replace(&format!("{{{}}}", key), value);
        }
        if result.contains("{host}") || result.contains("{port}") {
            let (host, port) = target.host_port()?;
            result = result.replace("{host}", &host).replace("{port}", &port.to_string());
        }
        Ok(result
            .replace("{url}", &target.url)
            .replace("{proxy}", proxy.unwrap_or(""))
            .replace("{task_id}", task_id))
    }

    fn build_command(
        &self,
        task_id: &str,
        target: &Target,
        plugin: &PluginDescriptor,
        proxy: Option<&str>,
    ) -> ScanResult<Command> {
        let program = plugin.command.as_deref().ok_or_else(|| {
            ScanError::ExecutionError(format!("plugin {} has no command", plugin.name))
        })?;

        let args = plugin
            .args
            .iter()
            .map(|arg| Self::substitute(arg, task_id, target, proxy))
            .collect::<ScanResult<Vec<_>>>()?;

        let mut command = Command::new(program);
        command
            .args(&args)
            .env("HYBRIDSCAN_TASK_ID", task_id)
            .env("HYBRIDSCAN_TARGET_URL", &target.url)
            .env("HYBRIDSCAN_IS_HTTPS", if target.is_https { "1" } else { "0" })
            .env("HYBRIDSCAN_PLUGIN", &plugin.name)
            .env("HYBRIDSCAN_PROXY", proxy.unwrap_or(""))
            .envs(self.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl PluginExecutor for ProcessExecutor {
    async fn execute(
        &self,
        task_id: &str,
        token: CancellationToken,
        target: &Target,
        plugin: &PluginDescriptor,
        proxy: Option<&str>,
        sink: ResultSink,
    ) -> ScanResult<()> {
        let mut command = self.build_command(task_id, target, plugin, proxy)?;
        debug!("Executing plugin {} for target {}", plugin.name, target.url);

        let mut child = command.spawn().map_err(|e| {
            ScanError::ExecutionError(format!("failed to start plugin {}: {}", plugin.name, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let request = target.request.clone();
            tokio::spawn(async move {
                let _ = stdin.write_all(&request).await;
            });
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScanError::ExecutionError("plugin stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ScanError::ExecutionError("plugin stderr unavailable".to_string()))?;

        let stdout_pump = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.strip_prefix(RESULT_PREFIX) {
                    Some(finding) => sink.result(finding.trim()),
                    None if line.trim().is_empty() => {}
                    None => sink.log("info", line),
                }
            }
        };
        let stderr_pump = async {
            let mut text = String::new();
            let _ = BufReader::new(stderr)
                .take(MAX_STDERR_BYTES)
                .read_to_string(&mut text)
                .await;
            text
        };
        let run = async {
            let (_, stderr_text, status) = tokio::join!(stdout_pump, stderr_pump, child.wait());
            (stderr_text, status)
        };

        let (stderr_text, status) = tokio::select! {
            _ = token.cancelled() => return Err(ScanError::Cancelled),
            finished = run => finished,
        };

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(ScanError::ExecutionError(format!(
                "plugin {} exited with {}: {}",
                plugin.name,
                status,
                stderr_text.trim()
            )))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::{ExecEventKind, Feedback};
    use crate::status::StatusManager;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn sink() -> (ResultSink, mpsc::UnboundedReceiver<crate::output::ScanResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feedback = Feedback::new(tx, Arc::new(StatusManager::new("t", 1, 1)));
        (ResultSink::new(feedback, 1, "p", "http://127.0.0.1:9/"), rx)
    }

    fn target() -> Target {
        Target::new("http://127.0.0.1:9/", false, b"GET / HTTP/1.1\r\n\r\n".to_vec())
            .with_var("path", "/admin")
    }

    #[tokio::test]
    async fn test_stdout_becomes_events() {
        let plugin = PluginDescriptor::new("echo", "yak").with_command(
            "sh",
            &["-c", "echo probing {host}:{port}{path}; echo 'RESULT: open admin panel'"],
        );
        let (sink, mut rx) = sink();
        ProcessExecutor::new()
            .execute("t", CancellationToken::new(), &target(), &plugin, None, sink)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap().exec_result.unwrap();
        assert_eq!(first.kind, ExecEventKind::Log);
        assert_eq!(first.message, "probing 127.0.0.1:9/admin");
        let second = rx.recv().await.unwrap().exec_result.unwrap();
        assert_eq!(second.kind, ExecEventKind::Result);
        assert_eq!(second.message, "open admin panel");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let plugin = PluginDescriptor::new("fail", "yak")
            .with_command("sh", &["-c", "echo broken >&2; exit 3"]);
        let (sink, _rx) = sink();
        let err = ProcessExecutor::new()
            .execute("t", CancellationToken::new(), &target(), &plugin, None, sink)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("fail"));
        assert!(msg.contains("broken"));
    }

    #[tokio::test]
    async fn test_missing_command_is_error() {
        let plugin = PluginDescriptor::new("no-cmd", "yak");
        let (sink, _rx) = sink();
        assert!(matches!(
            ProcessExecutor::new()
                .execute("t", CancellationToken::new(), &target(), &plugin, None, sink)
                .await,
            Err(ScanError::ExecutionError(_))
        ));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let plugin = PluginDescriptor::new("slow", "yak").with_command("sleep", &["5"]);
        let (sink, _rx) = sink();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = ProcessExecutor::new()
            .execute("t", token, &target(), &plugin, None, sink)
            .await;
        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
