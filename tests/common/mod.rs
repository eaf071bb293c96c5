//! In-process collaborators shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use hybridscan::{
    config::{EngineSettings, ScanConfig},
    network::TargetProbe,
    output::{ResultSink, ScanResponse},
    plugins::{InMemoryCatalog, PluginConfig, PluginDescriptor, PluginExecutor},
    scanner::HybridScanner,
    storage::{MemoryTaskStore, ScanTaskRecord, TaskStore},
    targets::{LineTargetGenerator, Target, TargetInput},
    task::ScanCommand,
    ScanError, ScanResult, TaskIndex,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn host_of(target: &Target) -> String {
    target.host_port().map(|(host, _)| host).unwrap_or_default()
}

/// Probe answering from configuration instead of the network
#[derive(Default)]
pub struct MockProbe {
    unreachable: HashSet<String>,
    no_baseline: HashSet<String>,
    panic_on: HashSet<String>,
    fingerprint_delay: Duration,
    fingerprints: Mutex<HashMap<String, Instant>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    pub fn without_baseline(mut self, host: &str) -> Self {
        self.no_baseline.insert(host.to_string());
        self
    }

    pub fn panicking_on(mut self, host: &str) -> Self {
        self.panic_on.insert(host.to_string());
        self
    }

    pub fn fingerprint_delay(mut self, delay: Duration) -> Self {
        self.fingerprint_delay = delay;
        self
    }

    /// When the fingerprint probe of `host` completed
    pub fn fingerprinted_at(&self, host: &str) -> Option<Instant> {
        self.fingerprints.lock().unwrap().get(host).copied()
    }
}

#[async_trait]
impl TargetProbe for MockProbe {
    async fn reachable(&self, target: &Target, _token: &CancellationToken) -> ScanResult<()> {
        let host = host_of(target);
        if self.panic_on.contains(&host) {
            panic!("probe exploded for {}", host);
        }
        if self.unreachable.contains(&host) {
            return Err(ScanError::NetworkError(format!("{} refused", host)));
        }
        Ok(())
    }

    async fn http_baseline(
        &self,
        target: &Target,
        _proxy: Option<&str>,
        _token: &CancellationToken,
    ) -> ScanResult<Vec<u8>> {
        if self.no_baseline.contains(&host_of(target)) {
            return Err(ScanError::NetworkError("baseline failed".to_string()));
        }
        Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
    }

    async fn fingerprint(&self, target: &Target) -> ScanResult<Option<String>> {
        tokio::time::sleep(self.fingerprint_delay).await;
        self.fingerprints
            .lock()
            .unwrap()
            .insert(host_of(target), Instant::now());
        Ok(Some("HTTP/1.1 200 OK".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub host: String,
    pub plugin: String,
    pub index: TaskIndex,
    pub started: Instant,
    /// Banner handed to port-scan plugins
    pub fingerprint: Option<String>,
}

/// Executor that sleeps, records what it ran and tracks its peak concurrency
#[derive(Default)]
pub struct MockExecutor {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    running: AtomicUsize,
    peak: AtomicUsize,
    executions: Mutex<Vec<Execution>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn delay_for(mut self, plugin: &str, delay: Duration) -> Self {
        self.delays.insert(plugin.to_string(), delay);
        self
    }

    pub fn failing(mut self, plugin: &str) -> Self {
        self.failing.insert(plugin.to_string());
        self
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn ran(&self, host: &str, plugin: &str) -> bool {
        self.executions()
            .iter()
            .any(|e| e.host == host && e.plugin == plugin)
    }
}

#[async_trait]
impl PluginExecutor for MockExecutor {
    async fn execute(
        &self,
        _task_id: &str,
        token: CancellationToken,
        target: &Target,
        plugin: &PluginDescriptor,
        _proxy: Option<&str>,
        sink: ResultSink,
    ) -> ScanResult<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.executions.lock().unwrap().push(Execution {
            host: host_of(target),
            plugin: plugin.name.clone(),
            index: sink.task_index(),
            started: Instant::now(),
            fingerprint: target.vars.get("fingerprint").cloned(),
        });

        let delay = self
            .delays
            .get(&plugin.name)
            .copied()
            .unwrap_or(self.default_delay);
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(ScanError::Cancelled),
            _ = tokio::time::sleep(delay) => {
                if self.failing.contains(&plugin.name) {
                    Err(ScanError::ExecutionError(format!("{} blew up", plugin.name)))
                } else {
                    sink.result(format!("{} checked {}", plugin.name, target.url));
                    Ok(())
                }
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Memory store whose `fail_on`-th save (1-based) fails
pub struct FlakyStore {
    inner: MemoryTaskStore,
    saves: AtomicUsize,
    fail_on: usize,
}

impl FlakyStore {
    pub fn failing_save(fail_on: usize) -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            saves: AtomicUsize::new(0),
            fail_on,
        }
    }
}

impl TaskStore for FlakyStore {
    fn save(&self, record: &ScanTaskRecord) -> ScanResult<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(ScanError::StorageError("disk full".to_string()));
        }
        self.inner.save(record)
    }

    fn load(&self, task_id: &str) -> ScanResult<ScanTaskRecord> {
        self.inner.load(task_id)
    }

    fn list(&self) -> ScanResult<Vec<ScanTaskRecord>> {
        self.inner.list()
    }

    fn delete(&self, task_id: &str) -> ScanResult<()> {
        self.inner.delete(task_id)
    }
}

pub fn catalog() -> InMemoryCatalog {
    let mut plugins: Vec<PluginDescriptor> = (1..=10)
        .map(|i| PluginDescriptor::new(format!("p{}", i), "yak"))
        .collect();
    plugins.push(PluginDescriptor::new("mitm-replay", "mitm"));
    plugins.push(PluginDescriptor::new("ports", "port-scan"));
    plugins.push(PluginDescriptor::new("broken", "yak"));
    InMemoryCatalog::new(plugins)
}

/// `t1.test` .. `tN.test`
pub fn hosts(count: usize) -> String {
    (1..=count)
        .map(|i| format!("http://t{}.test/", i))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn scan_config(targets: usize, plugins: &[&str], concurrency: usize) -> ScanConfig {
    ScanConfig::new(TargetInput::from_raw(hosts(targets)), PluginConfig::from_names(plugins))
        .with_concurrency(concurrency)
        .with_source("test")
}

pub fn scanner(store: Arc<dyn TaskStore>, probe: Arc<MockProbe>, executor: Arc<MockExecutor>) -> HybridScanner {
    let settings = EngineSettings {
        task_delay_ms_min: 0,
        task_delay_ms_max: 0,
        ..EngineSettings::default()
    };
    HybridScanner::new(
        store,
        Arc::new(catalog()),
        executor,
        probe,
        Arc::new(LineTargetGenerator::default()),
    )
    .with_settings(settings)
}

/// One open command stream
pub struct Session {
    pub commands: mpsc::UnboundedSender<ScanCommand>,
    pub responses: mpsc::UnboundedReceiver<ScanResponse>,
    pub handle: JoinHandle<ScanResult<ScanTaskRecord>>,
    seen: Vec<ScanResponse>,
}

impl Session {
    pub fn start(scanner: Arc<HybridScanner>, opening: ScanCommand) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (response_tx, responses) = mpsc::unbounded_channel();
        commands.send(opening).unwrap();
        let handle = tokio::spawn(async move {
            scanner
                .run(command_rx, response_tx, CancellationToken::new())
                .await
        });
        Self {
            commands,
            responses,
            handle,
            seen: Vec::new(),
        }
    }

    /// Task id carried by the first response
    pub async fn task_id(&mut self) -> String {
        let first = tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
            .await
            .unwrap()
            .unwrap();
        let id = first.status.task_id.clone();
        self.seen.push(first);
        id
    }

    pub fn send(&self, command: ScanCommand) {
        self.commands.send(command).unwrap();
    }

    /// Wait for the run to end and collect every response
    pub async fn finish(mut self) -> (ScanResult<ScanTaskRecord>, Vec<ScanResponse>) {
        let result = tokio::time::timeout(Duration::from_secs(20), self.handle)
            .await
            .expect("scan did not finish")
            .unwrap();
        while let Ok(response) = self.responses.try_recv() {
            self.seen.push(response);
        }
        (result, self.seen)
    }
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
