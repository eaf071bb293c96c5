//! Terminal rendering of the feedback stream

use super::{ActiveTaskOp, ExecEventKind, ScanResponse};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

/// Progress bar plus one line per execution event
pub struct ProgressDisplay {
    bar: ProgressBar,
    verbose: bool,
}

impl ProgressDisplay {
    pub fn new(verbose: bool) -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] [{bar:40.red/blue}] {pos}/{len} tasks {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
        bar.set_style(style);
        Self { bar, verbose }
    }

    /// Hidden bar, for non-interactive output
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            verbose: false,
        }
    }

    pub fn update(&self, response: &ScanResponse) {
        let status = &response.status;
        self.bar.set_length(status.total_tasks.max(0) as u64);
        self.bar.set_position(status.finished_tasks.max(0) as u64);
        self.bar.set_message(format!(
            "| targets {}/{} | active {} | {}",
            status.finished_targets, status.total_targets, status.active_tasks, status.status
        ));

        if let Some(event) = &response.exec_result {
            let line = match event.kind {
                ExecEventKind::Result => format!(
                    "{} {} {} {}",
                    "[+]".bright_green(),
                    event.plugin_name.bright_cyan(),
                    event.target_url,
                    event.message.bold()
                ),
                ExecEventKind::Log if event.level == "error" => format!(
                    "{} {} {} {}",
                    "[!]".bright_red(),
                    event.plugin_name.bright_yellow(),
                    event.target_url,
                    event.message
                ),
                ExecEventKind::Log => {
                    if !self.verbose {
                        return;
                    }
                    format!("{} {} {}", "[~]".bright_blue(), event.plugin_name, event.message)
                }
            };
            self.bar.println(line);
        }

        if self.verbose {
            if let Some(delta) = &response.active_task {
                let marker = match delta.operator {
                    ActiveTaskOp::Create => "start".bright_blue(),
                    ActiveTaskOp::Remove => "end".dimmed(),
                };
                self.bar
                    .println(format!("    #{} {} {} {}", delta.index, marker, delta.plugin_name, delta.url));
            }
        }
    }

    pub fn finish(&self, response: Option<&ScanResponse>) {
        if let Some(response) = response {
            self.update(response);
            self.bar
                .finish_with_message(format!("| task {} {}", response.status.task_id, response.status.status));
        } else {
            self.bar.finish_and_clear();
        }
    }
}
