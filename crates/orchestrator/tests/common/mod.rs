//! Recording fakes for every collaborator the engine calls out to.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::marker::PhantomData;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc;

use benchrig_orchestrator::actors::CoordinatorEvents;
use benchrig_orchestrator::collaborators::{
    Binaries, EngineToolkit, Launcher, MetricsStore, MetricsStoreFactory, NodeConfig, NodeSpec,
    Provisioner, ResultsSink, RunningNode, Supplier, WorkerCoordinator,
};
use benchrig_orchestrator::context::{BuildFlavor, HostConfig, MetricsContext, WorkloadSelection};
use benchrig_orchestrator::hosts::HostEndpoint;
use benchrig_orchestrator::{
    Collaborators, Config, FinalResults, InMemoryMetricsStoreFactory, MembershipFeed,
    MetricRecord, RunContext, Scope, TestExecution,
};

pub const WAIT: Duration = Duration::from_secs(5);
pub const QUIET: Duration = Duration::from_millis(300);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ip(addr: &str) -> IpAddr {
    addr.parse().unwrap()
}

pub fn endpoint(addr: &str, port: u16) -> HostEndpoint {
    HostEndpoint::new(ip(addr), port)
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for a run against `hosts`.
pub fn config_with_hosts(hosts: &[&str]) -> Config {
    let mut config = Config::new();
    config.add(Scope::Application, "workload", "workload.name", "geonames");
    config.add(Scope::Application, "workload", "test_procedure.name", "append-no-conflicts");
    config.add(
        Scope::Application,
        "builder",
        "provision_config_instance.names",
        serde_json::json!(["defaults"]),
    );
    config.add(Scope::Application, "builder", "repository.revision", "rev-42");
    config.add(Scope::Application, "client", "hosts", serde_json::json!(hosts));
    config
}

pub fn run_context(hosts: &[&str], flavor: BuildFlavor) -> RunContext {
    RunContext::from_config(config_with_hosts(hosts), flavor).unwrap()
}

/// Host configuration for a node builder on `host` owning `node_ids`.
pub fn host_config(host: HostEndpoint, node_ids: Vec<u32>, flavor: BuildFlavor) -> HostConfig {
    let config = config_with_hosts(&[]);
    let metrics = MetricsContext::for_run(&config, &WorkloadSelection::new("geonames"));
    HostConfig {
        config,
        metrics,
        flavor,
        endpoint: host,
        all_node_ips: vec![host.ip],
        all_node_ids: node_ids.clone(),
        node_ids,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE TOOLKIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Stage at which the recording toolkit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Supply,
    Provision,
    Launch,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolkitEvent {
    Supplied,
    Prepared { node_name: String, all_node_names: Vec<String> },
    Launched { nodes: Vec<String> },
    Stopped { nodes: Vec<String> },
    CleanedUp { node_name: String, preserve: bool },
}

#[derive(Default)]
struct ToolkitInner {
    events: Mutex<Vec<ToolkitEvent>>,
    fail_at: Mutex<Option<Stage>>,
    next_pid: AtomicU32,
}

impl ToolkitInner {
    fn record(&self, event: ToolkitEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn check(&self, stage: Stage) -> anyhow::Result<()> {
        if *self.fail_at.lock().unwrap() == Some(stage) {
            let reason = match stage {
                Stage::Supply => "artifact download failed",
                Stage::Provision => "disk full",
                Stage::Launch => "port already in use",
                Stage::Stop => "process did not terminate",
            };
            return Err(anyhow!(reason));
        }
        Ok(())
    }
}

/// Supplier, provisioner and launcher that only record what they are asked.
#[derive(Clone, Default)]
pub struct RecordingToolkit {
    inner: Arc<ToolkitInner>,
}

impl RecordingToolkit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(stage: Stage) -> Self {
        let toolkit = Self::default();
        *toolkit.inner.fail_at.lock().unwrap() = Some(stage);
        toolkit
    }

    pub fn events(&self) -> Vec<ToolkitEvent> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn launches(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ToolkitEvent::Launched { .. }))
            .count()
    }

    pub fn launched_nodes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ToolkitEvent::Launched { nodes } => Some(nodes),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ToolkitEvent::Stopped { .. }))
            .count()
    }

    pub fn cleanups(&self) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ToolkitEvent::CleanedUp { node_name, preserve } => Some((node_name, preserve)),
                _ => None,
            })
            .collect()
    }
}

struct FakeSupplier(Arc<ToolkitInner>);

#[async_trait]
impl Supplier for FakeSupplier {
    async fn supply(&self) -> anyhow::Result<Binaries> {
        self.0.check(Stage::Supply)?;
        self.0.record(ToolkitEvent::Supplied);
        Ok(Binaries {
            artifacts: vec![(
                "benchmark-candidate".to_string(),
                PathBuf::from("/tmp/benchmark-candidate.tar.gz"),
            )],
        })
    }
}

struct FakeProvisioner {
    inner: Arc<ToolkitInner>,
    spec: NodeSpec,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn prepare(&self, _binaries: &Binaries) -> anyhow::Result<NodeConfig> {
        self.inner.check(Stage::Provision)?;
        self.inner.record(ToolkitEvent::Prepared {
            node_name: self.spec.node_name.clone(),
            all_node_names: self.spec.all_node_names.clone(),
        });
        Ok(NodeConfig {
            node_name: self.spec.node_name.clone(),
            ip: self.spec.ip,
            http_port: self.spec.http_port,
            binary_path: PathBuf::from(format!("/opt/benchrig/{}", self.spec.node_name)),
            data_paths: vec![PathBuf::from(format!("/var/lib/benchrig/{}", self.spec.node_name))],
        })
    }

    async fn cleanup(&self, node: &NodeConfig, preserve: bool) -> anyhow::Result<()> {
        self.inner.record(ToolkitEvent::CleanedUp {
            node_name: node.node_name.clone(),
            preserve,
        });
        Ok(())
    }
}

struct FakeLauncher(Arc<ToolkitInner>);

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(&self, nodes: &[NodeConfig]) -> anyhow::Result<Vec<RunningNode>> {
        self.0.check(Stage::Launch)?;
        self.0.record(ToolkitEvent::Launched {
            nodes: nodes.iter().map(|n| n.node_name.clone()).collect(),
        });
        Ok(nodes
            .iter()
            .map(|n| RunningNode {
                node_name: n.node_name.clone(),
                ip: n.ip,
                pid: Some(1000 + self.0.next_pid.fetch_add(1, Ordering::SeqCst)),
            })
            .collect())
    }

    async fn stop(&self, nodes: &[RunningNode], _metrics: &dyn MetricsStore) -> anyhow::Result<()> {
        self.0.record(ToolkitEvent::Stopped {
            nodes: nodes.iter().map(|n| n.node_name.clone()).collect(),
        });
        self.0.check(Stage::Stop)
    }
}

impl EngineToolkit for RecordingToolkit {
    fn supplier(&self, _config: &Config, _flavor: BuildFlavor) -> anyhow::Result<Arc<dyn Supplier>> {
        Ok(Arc::new(FakeSupplier(Arc::clone(&self.inner))))
    }

    fn provisioner(
        &self,
        _config: &Config,
        _flavor: BuildFlavor,
        node: &NodeSpec,
    ) -> anyhow::Result<Arc<dyn Provisioner>> {
        Ok(Arc::new(FakeProvisioner {
            inner: Arc::clone(&self.inner),
            spec: node.clone(),
        }))
    }

    fn launcher(&self, _config: &Config, _flavor: BuildFlavor) -> anyhow::Result<Arc<dyn Launcher>> {
        Ok(Arc::new(FakeLauncher(Arc::clone(&self.inner))))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// How the scripted coordinator behaves once started.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// Finish every task, then complete.
    Complete { tasks: usize, pause_between: Duration },
    /// Start, then never report anything.
    Hang,
    /// Fail when asked to start.
    FailOnStart,
    /// Report a failure through the events handle after starting.
    ReportFailure,
}

pub struct ScriptedCoordinator {
    script: Script,
    prepared: AtomicUsize,
    started: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedCoordinator {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            prepared: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn completing(tasks: usize) -> Arc<Self> {
        Self::new(Script::Complete {
            tasks,
            pause_between: Duration::ZERO,
        })
    }

    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

pub fn task_metrics(task: usize) -> Vec<MetricRecord> {
    let name = format!("task-{task}");
    vec![
        MetricRecord::new(name.clone(), "throughput", 1000.0 + task as f64, "docs/s"),
        MetricRecord::new(name, "latency", 10.0 + task as f64, "ms"),
    ]
}

#[async_trait]
impl WorkerCoordinator for ScriptedCoordinator {
    async fn prepare_benchmark(
        &self,
        _ctx: &RunContext,
        events: CoordinatorEvents,
    ) -> anyhow::Result<()> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        events.preparation_complete("oss", Some("2.11.0".to_string()), Some("abc123".to_string()))?;
        Ok(())
    }

    async fn start_benchmark(&self, events: CoordinatorEvents) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        match self.script.clone() {
            Script::Complete {
                tasks,
                pause_between,
            } => {
                tokio::spawn(async move {
                    for task in 0..tasks {
                        let _ = events.task_finished(task_metrics(task), pause_between);
                    }
                    let _ = events.benchmark_complete(Vec::new());
                });
                Ok(())
            }
            Script::Hang => Ok(()),
            Script::FailOnStart => Err(anyhow!("load generator unreachable")),
            Script::ReportFailure => {
                events.failure(benchrig_orchestrator::FailureSignal::new("Load driver crashed"))?;
                Ok(())
            }
        }
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESULTS SINK
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct RecordingSink {
    notices: Mutex<Vec<String>>,
    stored: Mutex<Vec<TestExecution>>,
    published: Mutex<Vec<(TestExecution, FinalResults)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap().clone()
    }

    pub fn stored(&self) -> Vec<TestExecution> {
        self.stored.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(TestExecution, FinalResults)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultsSink for RecordingSink {
    fn notice(&self, message: &str) {
        self.notices.lock().unwrap().push(message.to_string());
    }

    async fn store_test_execution(&self, execution: &TestExecution) -> anyhow::Result<()> {
        self.stored.lock().unwrap().push(execution.clone());
        Ok(())
    }

    async fn publish(&self, execution: &TestExecution, results: &FinalResults) -> anyhow::Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((execution.clone(), results.clone()));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FAULTY METRICS STORES
// ═══════════════════════════════════════════════════════════════════════════════

/// Which store operation misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// `bulk_add` fails on the first store created, the orchestrator's own.
    FirstRejectsWrites,
    /// `reset_relative_time` crashes the calling actor.
    CrashOnReset,
    /// `close` crashes the calling actor.
    CrashOnClose,
}

/// Wraps the in-memory factory so its stores stay inspectable.
pub struct FaultyStoreFactory {
    inner: Arc<InMemoryMetricsStoreFactory>,
    fault: StoreFault,
    created: AtomicUsize,
}

impl FaultyStoreFactory {
    pub fn new(inner: Arc<InMemoryMetricsStoreFactory>, fault: StoreFault) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault,
            created: AtomicUsize::new(0),
        })
    }
}

impl MetricsStoreFactory for FaultyStoreFactory {
    fn create(&self, config: &Config) -> Arc<dyn MetricsStore> {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        let fault = match self.fault {
            StoreFault::FirstRejectsWrites if index > 0 => None,
            fault => Some(fault),
        };
        Arc::new(FaultyStore {
            inner: self.inner.create(config),
            fault,
        })
    }
}

struct FaultyStore {
    inner: Arc<dyn MetricsStore>,
    fault: Option<StoreFault>,
}

#[async_trait]
impl MetricsStore for FaultyStore {
    async fn open(&self, ctx: &MetricsContext) -> anyhow::Result<()> {
        self.inner.open(ctx).await
    }

    async fn bulk_add(&self, records: Vec<MetricRecord>) -> anyhow::Result<()> {
        if self.fault == Some(StoreFault::FirstRejectsWrites) {
            return Err(anyhow!("store down"));
        }
        self.inner.bulk_add(records).await
    }

    async fn flush(&self, refresh: bool) -> anyhow::Result<()> {
        self.inner.flush(refresh).await
    }

    fn reset_relative_time(&self) {
        self.inner.reset_relative_time();
        if self.fault == Some(StoreFault::CrashOnReset) {
            panic!("metrics clock corrupted");
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        if self.fault == Some(StoreFault::CrashOnClose) {
            panic!("metrics store connection lost");
        }
        self.inner.close().await
    }

    fn records(&self) -> Vec<MetricRecord> {
        self.inner.records()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborators wired to fakes, with handles to inspect them.
pub struct Harness {
    pub toolkit: RecordingToolkit,
    pub coordinator: Arc<ScriptedCoordinator>,
    pub metrics: Arc<InMemoryMetricsStoreFactory>,
    pub sink: Arc<RecordingSink>,
    pub feed: MembershipFeed,
}

impl Harness {
    pub fn new(toolkit: RecordingToolkit, coordinator: Arc<ScriptedCoordinator>) -> Self {
        Self {
            toolkit,
            coordinator,
            metrics: Arc::new(InMemoryMetricsStoreFactory::new()),
            sink: RecordingSink::new(),
            feed: MembershipFeed::new(),
        }
    }

    pub fn with_toolkit(toolkit: RecordingToolkit) -> Self {
        Self::new(toolkit, ScriptedCoordinator::completing(1))
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(Arc::new(self.toolkit.clone()), self.coordinator.clone())
            .with_metrics(self.metrics.clone())
            .with_results(self.sink.clone())
            .with_discovery(Arc::new(self.feed.clone()))
    }

    pub async fn wait_for_subscription(&self) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.feed.subscriptions_created() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROBE ACTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Actor that forwards everything it receives to a channel.
pub struct ForwardingActor<M>(PhantomData<fn() -> M>);

impl<M> Default for ForwardingActor<M> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<M: ractor::Message> Actor for ForwardingActor<M> {
    type Msg = M;
    type State = mpsc::UnboundedSender<M>;
    type Arguments = mpsc::UnboundedSender<M>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        sender: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(sender)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        sender: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = sender.send(message);
        Ok(())
    }
}

/// Spawn a probe standing in for a parent actor.
pub async fn probe<M: ractor::Message>() -> (ActorRef<M>, mpsc::UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (actor, _handle) = Actor::spawn(None, ForwardingActor::<M>::default(), tx)
        .await
        .expect("probe should spawn");
    (actor, rx)
}

/// Next message, or `None` after `within`.
pub async fn next<M>(rx: &mut mpsc::UnboundedReceiver<M>, within: Duration) -> Option<M> {
    tokio::time::timeout(within, rx.recv()).await.ok().flatten()
}

/// Wait until `condition` holds or `WAIT` elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
