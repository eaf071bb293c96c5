//! Control-plane service driving one scan per command stream

use super::dispatcher::{Checkpoint, DispatchOptions, DispatchOutcome, Dispatcher, ResumePlan};
use super::registry::RunningTasks;
use crate::config::{EngineSettings, ScanConfig};
use crate::error::panic_message;
use crate::network::{NetworkProbe, TargetProbe};
use crate::output::{Feedback, ScanResponse};
use crate::plugins::{
    decode_plugin_names, encode_plugin_names, InMemoryCatalog, PluginCatalog, PluginExecutor,
    PluginSet, ProcessExecutor,
};
use crate::status::StatusManager;
use crate::storage::{FileTaskStore, ScanTaskRecord, TaskStatus, TaskStore};
use crate::targets::{decode_targets, encode_targets, LineTargetGenerator, Target, TargetGenerator};
use crate::task::{ScanCommand, TaskManager};
use crate::{ScanError, ScanResult};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a run needs once the opening command has been resolved
struct PreparedScan {
    record: ScanTaskRecord,
    config: ScanConfig,
    targets: Vec<Target>,
    plugins: PluginSet,
    resume: Option<ResumePlan>,
}

/// Mark a record failed, even when a checkpoint already paused it
fn fail_record(record: &mut ScanTaskRecord, reason: String) {
    if record.status == TaskStatus::Paused {
        record.status = TaskStatus::Executing;
    }
    if let Err(e) = record.fail(reason) {
        warn!("Task {} could not be marked failed: {}", record.task_id, e);
    }
}

/// Settle the record from the dispatch result; returns what the run reports
fn settle(
    record: &mut ScanTaskRecord,
    joined: Result<ScanResult<DispatchOutcome>, tokio::task::JoinError>,
) -> ScanResult<()> {
    match joined {
        Ok(Ok(outcome)) => match record.status {
            // unreachable targets are reported once the scan ends
            TaskStatus::Paused => Ok(()),
            _ => {
                if let Err(e) = record.transition(TaskStatus::Done) {
                    warn!("Task {} could not be marked done: {}", record.task_id, e);
                }
                outcome.into_result()
            }
        },
        Ok(Err(e)) => {
            error!("Task {} failed: {}", record.task_id, e);
            fail_record(record, e.to_string());
            Err(e)
        }
        Err(e) => {
            let reason = if e.is_panic() {
                panic_message(&*e.into_panic())
            } else {
                e.to_string()
            };
            error!("Task {} scan routine panicked: {}", record.task_id, reason);
            fail_record(record, reason.clone());
            Err(ScanError::Panicked(reason))
        }
    }
}

/// Hybrid scan service.
///
/// Each call to [`HybridScanner::run`] serves one command stream: it opens a
/// new scan or resumes a paused one, applies follow-up pause/stop commands,
/// streams [`ScanResponse`]s and persists the task record at start, at the
/// pause checkpoint and at the end.
pub struct HybridScanner {
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn PluginCatalog>,
    executor: Arc<dyn PluginExecutor>,
    probe: Arc<dyn TargetProbe>,
    generator: Arc<dyn TargetGenerator>,
    settings: EngineSettings,
    running: RunningTasks,
}

impl HybridScanner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn PluginCatalog>,
        executor: Arc<dyn PluginExecutor>,
        probe: Arc<dyn TargetProbe>,
        generator: Arc<dyn TargetGenerator>,
    ) -> Self {
        Self {
            store,
            catalog,
            executor,
            probe,
            generator,
            settings: EngineSettings::default(),
            running: RunningTasks::new(),
        }
    }

    /// Service wired with the bundled file store, catalog, executor and probes
    pub fn from_settings(settings: EngineSettings) -> ScanResult<Self> {
        settings.validate()?;
        let storage_dir = match &settings.storage_dir {
            Some(dir) => dir.clone(),
            None => FileTaskStore::default_location()?,
        };
        let catalog = match &settings.catalog {
            Some(path) => InMemoryCatalog::from_toml_file(path)?,
            None => {
                debug!("No plugin catalog configured");
                InMemoryCatalog::default()
            }
        };
        let probe = NetworkProbe::new(
            settings.reachability_timeout(),
            settings.http_probe_timeout(),
            settings.fingerprint_timeout(),
        );

        Ok(Self::new(
            Arc::new(FileTaskStore::new(storage_dir)?),
            Arc::new(catalog),
            Arc::new(ProcessExecutor::new()),
            Arc::new(probe),
            Arc::new(LineTargetGenerator::default()),
        )
        .with_settings(settings))
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share a registry with other services
    pub fn with_running_tasks(mut self, running: RunningTasks) -> Self {
        self.running = running;
        self
    }

    pub fn running_tasks(&self) -> &RunningTasks {
        &self.running
    }

    /// Serve one command stream until its scan ends.
    ///
    /// Returns the final record. A scan that completed with unreachable
    /// targets still ends `Done`, but is reported as
    /// [`ScanError::UnreachableTargets`], including targets found
    /// unreachable before a pause. A failed final save still streams the
    /// terminal status and then returns the storage error.
    pub async fn run(
        &self,
        mut commands: mpsc::UnboundedReceiver<ScanCommand>,
        responses: mpsc::UnboundedSender<ScanResponse>,
        parent: CancellationToken,
    ) -> ScanResult<ScanTaskRecord> {
        let opening = commands.recv().await.ok_or_else(|| {
            ScanError::InvalidCommand("stream closed before a scan was opened".to_string())
        })?;

        let prepared = match opening {
            ScanCommand::New(config) => self.prepare_new(config)?,
            ScanCommand::Resume { task_id } => self.prepare_resume(&task_id)?,
            other @ (ScanCommand::Pause | ScanCommand::Stop) => {
                return Err(ScanError::InvalidCommand(format!(
                    "{} cannot open a scan stream",
                    other.name()
                )));
            }
        };
        let PreparedScan {
            record,
            config,
            targets,
            plugins,
            resume,
        } = prepared;
        let task_id = record.task_id.clone();

        let manager = Arc::new(TaskManager::new(&parent));
        let _registration = self.running.register(&task_id, Arc::clone(&manager)).ok_or_else(|| {
            ScanError::InvalidCommand(format!("task {} is already running", task_id))
        })?;
        manager.start(config.total_timeout());

        let status = Arc::new(StatusManager::new(&task_id, targets.len(), plugins.len()));
        let feedback = Feedback::new(responses, Arc::clone(&status));
        let record = Arc::new(Mutex::new(record));

        let control = tokio::spawn(Self::control_loop(commands, Arc::clone(&manager)));

        info!(
            "Task {} {}: {} targets, {} plugins, concurrency {}",
            task_id,
            if resume.is_some() { "resumed" } else { "started" },
            targets.len(),
            plugins.len(),
            config.concurrency
        );
        feedback.status();

        let options = DispatchOptions {
            concurrency: config.concurrency,
            proxy: config.proxy.clone(),
            delay_window: self.settings.task_delay_window(),
        };
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&manager),
            feedback.clone(),
            plugins,
            Arc::clone(&self.executor),
            Arc::clone(&self.probe),
            options,
        );
        if let Some(plan) = resume {
            dispatcher = dispatcher.with_resume(plan);
        }

        let on_checkpoint = {
            let store = Arc::clone(&self.store);
            let record = Arc::clone(&record);
            let status = Arc::clone(&status);
            move |checkpoint: &Checkpoint| -> ScanResult<()> {
                let mut current = record.lock().unwrap_or_else(|e| e.into_inner());
                let mut next = current.clone();
                next.set_checkpoint(&checkpoint.survivors, checkpoint.cursor, &checkpoint.unreachable);
                next.transition(TaskStatus::Paused)?;
                store.save(&next)?;
                *current = next;
                status.set_phase(TaskStatus::Paused);
                Ok(())
            }
        };

        // a panic in the scan routine ends up in the JoinError, not here
        let dispatch = tokio::spawn(async move { dispatcher.run(targets, on_checkpoint).await });
        let joined = dispatch.await;
        control.abort();
        manager.release();

        let mut record = record.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let result = settle(&mut record, joined);

        // the stream always ends with the terminal status, persisted or not
        status.set_phase(record.status);
        let saved = self.store.save(&record);
        feedback.status();
        if let Err(e) = saved {
            error!("Task {} final state {} not persisted: {}", task_id, record.status, e);
            return Err(e);
        }
        info!("Task {} ended {}", task_id, record.status);

        result.map(|()| record)
    }

    /// Follow-up commands on an open stream
    async fn control_loop(mut commands: mpsc::UnboundedReceiver<ScanCommand>, manager: Arc<TaskManager>) {
        while let Some(command) = commands.recv().await {
            match command {
                ScanCommand::Pause => manager.pause(),
                ScanCommand::Stop => manager.stop(),
                ScanCommand::New(_) | ScanCommand::Resume { .. } => {
                    warn!("Ignoring {} on a stream that already drives a scan", command.name());
                }
            }
        }
        debug!("Command stream closed");
    }

    fn prepare_new(&self, config: ScanConfig) -> ScanResult<PreparedScan> {
        config.validate()?;

        let targets = self.generator.generate(&config.targets).map_err(|e| match e {
            ScanError::TargetGeneration(_) => e,
            other => ScanError::TargetGeneration(other.to_string()),
        })?;
        if targets.is_empty() {
            return Err(ScanError::TargetGeneration("no targets generated".to_string()));
        }
        let plugins = PluginSet::materialize(self.catalog.as_ref(), &config.plugins)?;

        let record = ScanTaskRecord::new(
            Uuid::new_v4().to_string(),
            encode_targets(&targets)?,
            encode_plugin_names(&plugins.names())?,
            config.to_json()?,
        );
        self.store.save(&record)?;

        Ok(PreparedScan {
            record,
            config,
            targets,
            plugins,
            resume: None,
        })
    }

    fn prepare_resume(&self, task_id: &str) -> ScanResult<PreparedScan> {
        if self.running.contains(task_id) {
            return Err(ScanError::InvalidCommand(format!("task {} is already running", task_id)));
        }
        let mut record = self.store.load(task_id)?;
        if record.status != TaskStatus::Paused {
            return Err(ScanError::InvalidTransition {
                from: record.status.to_string(),
                to: TaskStatus::Executing.to_string(),
            });
        }

        let targets = decode_targets(&record.targets)?;
        let names = decode_plugin_names(&record.plugins)?;
        let plugins = PluginSet::restore(self.catalog.as_ref(), &names)?;
        let config = ScanConfig::from_json(&record.scan_config)?;
        let plan = ResumePlan::new(record.dispatch_cursor, &record.survival_indexes()?)
            .with_unreachable(record.unreachable_targets.clone());

        record.transition(TaskStatus::Executing)?;
        self.store.save(&record)?;

        Ok(PreparedScan {
            record,
            config,
            targets,
            plugins,
            resume: Some(plan),
        })
    }

    /// Pause a running task from outside its stream
    pub fn pause_task(&self, task_id: &str) -> ScanResult<()> {
        self.running
            .get(task_id)
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))?
            .pause();
        Ok(())
    }

    pub fn stop_task(&self, task_id: &str) -> ScanResult<()> {
        self.running
            .get(task_id)
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))?
            .stop();
        Ok(())
    }

    /// Newest first
    pub fn list_tasks(&self) -> ScanResult<Vec<ScanTaskRecord>> {
        self.store.list()
    }

    pub fn get_task(&self, task_id: &str) -> ScanResult<ScanTaskRecord> {
        self.store.load(task_id)
    }

    pub fn delete_task(&self, task_id: &str) -> ScanResult<()> {
        if self.running.contains(task_id) {
            return Err(ScanError::InvalidCommand(format!(
                "task {} is running and cannot be deleted",
                task_id
            )));
        }
        self.store.delete(task_id)
    }
}
