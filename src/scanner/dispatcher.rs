//! Target x plugin scheduling loop
//!
//! Targets are walked in generator order. Each one is probed for
//! reachability and an HTTP baseline, gets a one-shot fingerprint probe in
//! the background, then has the plugin set replayed onto a bounded worker
//! pool. Pause takes effect at checkpoints placed right before admissions;
//! admitted work always drains before [`Dispatcher::run`] returns.

use super::gate::{fingerprint_gate, FingerprintGate};
use crate::error::panic_message;
use crate::output::{ActiveTaskDelta, ActiveTaskOp, Feedback, ResultSink};
use crate::plugins::{PluginDescriptor, PluginExecutor, PluginKind, PluginSet};
use crate::status::{StatusManager, TaskIndex};
use crate::targets::Target;
use crate::task::TaskManager;
use crate::network::TargetProbe;
use crate::{ScanError, ScanResult};
use futures::future::join_all;
use futures::FutureExt;
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Execution knobs taken from the scan request and engine settings
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub concurrency: usize,
    pub proxy: Option<String>,
    /// Random post-task delay in ms, inclusive
    pub delay_window: Option<(u64, u64)>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            concurrency: crate::config::DEFAULT_CONCURRENCY,
            proxy: None,
            delay_window: None,
        }
    }
}

/// Which pairs a resumed run still has to execute.
///
/// A pair is pending when its index is above the persisted cursor or was in
/// flight when the checkpoint fired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePlan {
    cursor: TaskIndex,
    survivors: BTreeSet<TaskIndex>,
    unreachable: Vec<String>,
}

impl ResumePlan {
    pub fn new(cursor: TaskIndex, survivors: &[TaskIndex]) -> Self {
        Self {
            cursor,
            survivors: survivors.iter().copied().collect(),
            unreachable: Vec::new(),
        }
    }

    /// Targets an earlier run already found unreachable
    pub fn with_unreachable(mut self, urls: Vec<String>) -> Self {
        self.unreachable = urls;
        self
    }

    pub fn is_pending(&self, index: TaskIndex) -> bool {
        index > self.cursor || self.survivors.contains(&index)
    }

    /// Whether any index in `first..first + plugins` is pending
    pub fn target_pending(&self, first: TaskIndex, plugins: u64) -> bool {
        first + plugins > self.cursor + 1 || self.survivors.range(first..first + plugins).next().is_some()
    }
}

/// State persisted when a pause takes effect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Indexes still in flight, ascending
    pub survivors: Vec<TaskIndex>,
    /// Highest index handed out
    pub cursor: TaskIndex,
    /// Unreachable targets seen so far, earlier runs included
    pub unreachable: Vec<String>,
}

/// What happened during one dispatch run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// URLs that failed the reachability probe, earlier runs included
    pub unreachable: Vec<String>,
}

impl DispatchOutcome {
    /// Aggregate unreachable targets into a single error
    pub fn into_result(self) -> ScanResult<()> {
        if self.unreachable.is_empty() {
            Ok(())
        } else {
            Err(ScanError::UnreachableTargets(self.unreachable))
        }
    }
}

pub struct Dispatcher {
    task_id: String,
    manager: Arc<TaskManager>,
    status: Arc<StatusManager>,
    feedback: Feedback,
    plugins: PluginSet,
    executor: Arc<dyn PluginExecutor>,
    probe: Arc<dyn TargetProbe>,
    options: DispatchOptions,
    resume: Option<ResumePlan>,
}

/// Per-worker state moved into the spawned task
struct Assignment {
    index: TaskIndex,
    permit: OwnedSemaphorePermit,
    target: Arc<Target>,
    plugin: Arc<PluginDescriptor>,
    gate: FingerprintGate,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<TaskManager>,
        feedback: Feedback,
        plugins: PluginSet,
        executor: Arc<dyn PluginExecutor>,
        probe: Arc<dyn TargetProbe>,
        options: DispatchOptions,
    ) -> Self {
        let status = Arc::clone(feedback.status_manager());
        Self {
            task_id: status.task_id().to_string(),
            manager,
            status,
            feedback,
            plugins,
            executor,
            probe,
            options,
            resume: None,
        }
    }

    pub fn with_resume(mut self, plan: ResumePlan) -> Self {
        self.resume = Some(plan);
        self
    }

    /// Dispatch every (target, plugin) pair.
    ///
    /// `on_checkpoint` receives the [`Checkpoint`] when a pause takes
    /// effect. Its failure ends dispatch with that error,
    /// after admitted work has drained.
    pub async fn run<F>(&self, targets: Vec<Target>, mut on_checkpoint: F) -> ScanResult<DispatchOutcome>
    where
        F: FnMut(&Checkpoint) -> ScanResult<()> + Send,
    {
        let mut outcome = DispatchOutcome {
            unreachable: self
                .resume
                .as_ref()
                .map(|plan| plan.unreachable.clone())
                .unwrap_or_default(),
        };
        let mut waiters = Vec::with_capacity(targets.len());

        info!(
            "Dispatching {} targets x {} plugins for task {}",
            targets.len(),
            self.plugins.len(),
            self.task_id
        );
        let result = self
            .dispatch_targets(targets, &mut on_checkpoint, &mut outcome, &mut waiters)
            .await;

        for joined in join_all(waiters).await {
            if let Err(e) = joined {
                error!("Target waiter failed: {}", e);
            }
        }
        debug!("Task {} drained", self.task_id);

        result.map(|()| outcome)
    }

    async fn dispatch_targets<F>(
        &self,
        targets: Vec<Target>,
        on_checkpoint: &mut F,
        outcome: &mut DispatchOutcome,
        waiters: &mut Vec<JoinHandle<()>>,
    ) -> ScanResult<()>
    where
        F: FnMut(&Checkpoint) -> ScanResult<()> + Send,
    {
        let token = self.manager.token();
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let plugin_total = self.plugins.len() as u64;

        for mut target in targets {
            if self.halt(on_checkpoint, outcome)? {
                return Ok(());
            }

            if let Some(plan) = &self.resume {
                if !plan.target_pending(self.status.last_index() + 1, plugin_total) {
                    debug!("Target {} finished in an earlier run", target.url);
                    self.status.skip_target();
                    self.feedback.status();
                    continue;
                }
            }

            self.status.do_active_target();

            if let Err(e) = self.probe.reachable(&target, &token).await {
                if token.is_cancelled() {
                    self.status.abandon_target();
                    return Ok(());
                }
                warn!("Target {} unreachable: {}", target.url, e);
                outcome.unreachable.push(target.url.clone());
                self.status.done_failure_target();
                self.feedback.status();
                continue;
            }

            let skip_mitm = match self
                .probe
                .http_baseline(&target, self.options.proxy.as_deref(), &token)
                .await
            {
                Ok(response) => {
                    target.response = response;
                    false
                }
                Err(_) if token.is_cancelled() => {
                    self.status.abandon_target();
                    return Ok(());
                }
                Err(e) => {
                    debug!("HTTP baseline for {} failed, mitm plugins skipped: {}", target.url, e);
                    true
                }
            };
            let target = Arc::new(target);
            let gate = self.spawn_fingerprint(&target);

            let mut workers = Vec::with_capacity(self.plugins.len());
            let mut completed = true;

            for plugin in self.plugins.cursor() {
                if let Some(plan) = &self.resume {
                    if !plan.is_pending(self.status.last_index() + 1) {
                        self.status.skip_task();
                        continue;
                    }
                }

                if self.halt(on_checkpoint, outcome)? {
                    completed = false;
                    break;
                }
                let permit = tokio::select! {
                    _ = token.cancelled() => None,
                    permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    completed = false;
                    break;
                };
                // a pause may have arrived while waiting for the slot
                if self.halt(on_checkpoint, outcome)? {
                    completed = false;
                    break;
                }

                let index = self.status.do_active_task();
                if plugin.kind == PluginKind::Mitm && skip_mitm {
                    debug!("Skipping mitm plugin {} for {}", plugin.name, target.url);
                    self.status.done_task(index);
                    self.feedback.status();
                    continue;
                }

                workers.push(self.spawn_worker(Assignment {
                    index,
                    permit,
                    target: Arc::clone(&target),
                    plugin,
                    gate: gate.clone(),
                }));
            }

            waiters.push(self.spawn_target_waiter(workers, completed));
            if !completed {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Checkpoint; `true` when dispatch must end
    fn halt<F>(&self, on_checkpoint: &mut F, outcome: &DispatchOutcome) -> ScanResult<bool>
    where
        F: FnMut(&Checkpoint) -> ScanResult<()>,
    {
        let flow = self.manager.checkpoint(|| {
            let checkpoint = self.checkpoint_state(outcome);
            info!(
                "Checkpoint for task {}: {} in flight, cursor {}, {} unreachable",
                self.task_id,
                checkpoint.survivors.len(),
                checkpoint.cursor,
                checkpoint.unreachable.len()
            );
            on_checkpoint(&checkpoint)
        })?;
        Ok(flow.is_break())
    }

    /// Survival set and cursor, carrying over what an earlier run left pending
    fn checkpoint_state(&self, outcome: &DispatchOutcome) -> Checkpoint {
        let mut survivors: BTreeSet<TaskIndex> =
            self.status.get_current_active_task_indexes().into_iter().collect();
        let mut cursor = self.status.last_index();
        if let Some(plan) = &self.resume {
            survivors.extend(plan.survivors.range(cursor + 1..).copied());
            cursor = cursor.max(plan.cursor);
        }
        Checkpoint {
            survivors: survivors.into_iter().collect(),
            cursor,
            unreachable: outcome.unreachable.clone(),
        }
    }

    fn spawn_fingerprint(&self, target: &Arc<Target>) -> FingerprintGate {
        let (signal, gate) = fingerprint_gate();
        let probe = Arc::clone(&self.probe);
        let target = Arc::clone(target);
        let token = self.manager.token();

        tokio::spawn(async move {
            let banner = tokio::select! {
                _ = token.cancelled() => None,
                result = probe.fingerprint(&target) => match result {
                    Ok(banner) => banner,
                    Err(e) => {
                        debug!("Fingerprint of {} failed: {}", target.url, e);
                        None
                    }
                },
            };
            signal.resolve(banner);
        });
        gate
    }

    fn spawn_worker(&self, assignment: Assignment) -> JoinHandle<()> {
        let Assignment {
            index,
            permit,
            target,
            plugin,
            gate,
        } = assignment;
        let executor = Arc::clone(&self.executor);
        let status = Arc::clone(&self.status);
        let feedback = self.feedback.clone();
        let token = self.manager.token();
        let task_id = self.task_id.clone();
        let proxy = self.options.proxy.clone();
        let delay_window = self.options.delay_window;

        tokio::spawn(async move {
            let _permit = permit;
            let mut target = target;

            if plugin.kind == PluginKind::PortScan {
                let fingerprint = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Port-scan plugin {} cancelled before fingerprint", plugin.name);
                        status.done_task(index);
                        feedback.status();
                        return;
                    }
                    fingerprint = gate.wait() => fingerprint,
                };
                if let Some(banner) = fingerprint.and_then(|f| f.banner) {
                    target = Arc::new(target.as_ref().clone().with_var("fingerprint", banner));
                }
            }

            feedback.active(ActiveTaskDelta::new(ActiveTaskOp::Create, index, &target, &plugin.name));
            let sink = ResultSink::new(feedback.clone(), index, &plugin.name, &target.url);

            let execution = executor.execute(
                &task_id,
                token.clone(),
                &target,
                &plugin,
                proxy.as_deref(),
                sink.clone(),
            );
            match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(Ok(())) => debug!("Task {} ({} on {}) finished", index, plugin.name, target.url),
                Ok(Err(ScanError::Cancelled)) => debug!("Task {} cancelled", index),
                Ok(Err(e)) => {
                    warn!("Plugin {} failed on {}: {}", plugin.name, target.url, e);
                    sink.log("error", e.to_string());
                }
                Err(payload) => {
                    let reason = panic_message(&*payload);
                    error!("Plugin {} panicked on {}: {}", plugin.name, target.url, reason);
                    sink.log("error", format!("plugin panicked: {}", reason));
                }
            }

            feedback.active(ActiveTaskDelta::new(ActiveTaskOp::Remove, index, &target, &plugin.name));
            status.done_task(index);
            feedback.status();

            if let Some((min, max)) = delay_window {
                let delay = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    /// Marks the target done once its workers have drained
    fn spawn_target_waiter(&self, workers: Vec<JoinHandle<()>>, completed: bool) -> JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let feedback = self.feedback.clone();

        tokio::spawn(async move {
            for joined in join_all(workers).await {
                if let Err(e) = joined {
                    error!("Plugin worker failed: {}", e);
                }
            }
            if completed {
                status.done_target();
            } else {
                status.abandon_target();
            }
            feedback.status();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_plan_pending_pairs() {
        let plan = ResumePlan::new(4, &[2, 4]);
        let pending: Vec<_> = (1..=6).filter(|i| plan.is_pending(*i)).collect();
        assert_eq!(pending, vec![2, 4, 5, 6]);
    }

    #[test]
    fn test_resume_plan_target_pending() {
        // 3 plugins per target: target 1 = 1..=3, target 2 = 4..=6
        let plan = ResumePlan::new(6, &[5]);
        assert!(!plan.target_pending(1, 3));
        assert!(plan.target_pending(4, 3));
        assert!(plan.target_pending(7, 3));

        let plan = ResumePlan::new(3, &[]);
        assert!(!plan.target_pending(1, 3));
        assert!(plan.target_pending(4, 3));
    }

    #[test]
    fn test_outcome_aggregates_unreachable() {
        assert!(DispatchOutcome::default().into_result().is_ok());
        let outcome = DispatchOutcome {
            unreachable: vec!["http://a/".into(), "http://b/".into()],
        };
        match outcome.into_result() {
            Err(ScanError::UnreachableTargets(urls)) => assert_eq!(urls.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}
