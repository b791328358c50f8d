//! Interfaces of the systems the engine drives but does not implement.
//!
//! Binary supply, provisioning, process launching, metrics storage, load
//! generation and result publishing live behind these traits. The engine
//! only decides when and where each is called.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use benchrig_core::Config;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::actors::events::CoordinatorEvents;
use crate::context::{BuildFlavor, MetricsContext, RunContext};
use crate::discovery::{DiscoveryFeed, MembershipFeed};
use crate::hosts::{HostResolver, SystemResolver};
use crate::results::{FinalResults, MetricRecord, TestExecution};

/// Artifacts produced by a supplier, keyed by component name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binaries {
    pub artifacts: Vec<(String, PathBuf)>,
}

/// Identity of one node as seen by its provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub node_id: u32,
    pub node_name: String,
    pub ip: IpAddr,
    pub http_port: u16,
    /// Addresses of every host in the cluster.
    pub all_node_ips: Vec<IpAddr>,
    /// Names of every node in the cluster.
    pub all_node_names: Vec<String>,
}

/// A node that is installed and ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_name: String,
    pub ip: IpAddr,
    pub http_port: u16,
    pub binary_path: PathBuf,
    pub data_paths: Vec<PathBuf>,
}

/// A launched node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningNode {
    pub node_name: String,
    pub ip: IpAddr,
    pub pid: Option<u32>,
}

/// Obtains the binaries to install.
#[async_trait]
pub trait Supplier: Send + Sync {
    async fn supply(&self) -> anyhow::Result<Binaries>;
}

/// Installs and configures a single node.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn prepare(&self, binaries: &Binaries) -> anyhow::Result<NodeConfig>;

    /// Remove install and data directories unless `preserve` is set.
    async fn cleanup(&self, node: &NodeConfig, preserve: bool) -> anyhow::Result<()>;
}

/// Starts and stops node processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, nodes: &[NodeConfig]) -> anyhow::Result<Vec<RunningNode>>;

    async fn stop(&self, nodes: &[RunningNode], metrics: &dyn MetricsStore) -> anyhow::Result<()>;
}

/// Creates the supply/provision/launch pipeline for one host.
pub trait EngineToolkit: Send + Sync {
    fn supplier(&self, config: &Config, flavor: BuildFlavor) -> anyhow::Result<Arc<dyn Supplier>>;

    fn provisioner(
        &self,
        config: &Config,
        flavor: BuildFlavor,
        node: &NodeSpec,
    ) -> anyhow::Result<Arc<dyn Provisioner>>;

    fn launcher(&self, config: &Config, flavor: BuildFlavor) -> anyhow::Result<Arc<dyn Launcher>>;
}

/// Metrics storage session.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn open(&self, ctx: &MetricsContext) -> anyhow::Result<()>;

    async fn bulk_add(&self, records: Vec<MetricRecord>) -> anyhow::Result<()>;

    async fn flush(&self, refresh: bool) -> anyhow::Result<()>;

    /// Restart the clock relative timestamps are measured against.
    fn reset_relative_time(&self);

    async fn close(&self) -> anyhow::Result<()>;

    /// All records added so far.
    fn records(&self) -> Vec<MetricRecord>;
}

/// Opens a metrics store for a configuration.
pub trait MetricsStoreFactory: Send + Sync {
    fn create(&self, config: &Config) -> Arc<dyn MetricsStore>;
}

/// Load generator driving the workload against the cluster.
///
/// Progress is reported asynchronously through [`CoordinatorEvents`].
#[async_trait]
pub trait WorkerCoordinator: Send + Sync {
    async fn prepare_benchmark(&self, ctx: &RunContext, events: CoordinatorEvents)
    -> anyhow::Result<()>;

    async fn start_benchmark(&self, events: CoordinatorEvents) -> anyhow::Result<()>;

    /// Release load generators. Called once per run.
    async fn shutdown(&self);
}

/// Destination of the run record and results.
#[async_trait]
pub trait ResultsSink: Send + Sync {
    /// Show a progress message to the user.
    fn notice(&self, message: &str) {
        info!(target: "benchrig::console", "{}", message);
    }

    async fn store_test_execution(&self, execution: &TestExecution) -> anyhow::Result<()>;

    async fn publish(&self, execution: &TestExecution, results: &FinalResults)
    -> anyhow::Result<()>;
}

/// Sink that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingResultsSink;

#[async_trait]
impl ResultsSink for LoggingResultsSink {
    async fn store_test_execution(&self, execution: &TestExecution) -> anyhow::Result<()> {
        debug!(test_execution_id = %execution.id, "Storing test execution");
        Ok(())
    }

    async fn publish(&self, execution: &TestExecution, results: &FinalResults) -> anyhow::Result<()> {
        for summary in &results.summaries {
            info!(
                target: "benchrig::console",
                test_execution_id = %execution.id,
                task = %summary.task,
                metric = %summary.name,
                count = summary.count,
                min = summary.min,
                mean = summary.mean,
                max = summary.max,
                unit = %summary.unit,
                "Result"
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
struct StoreState {
    context: Option<MetricsContext>,
    buffered: Vec<MetricRecord>,
    flushed: Vec<MetricRecord>,
    origin: Instant,
    flushes: usize,
    resets: usize,
    closed: bool,
}

/// Metrics store that keeps everything in memory.
#[derive(Debug)]
pub struct InMemoryMetricsStore {
    state: Mutex<StoreState>,
}

impl Default for InMemoryMetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetricsStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                context: None,
                buffered: Vec::new(),
                flushed: Vec::new(),
                origin: Instant::now(),
                flushes: 0,
                resets: 0,
                closed: false,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Time since the store was created or last reset.
    #[must_use]
    pub fn relative_time(&self) -> std::time::Duration {
        self.with_state(|s| s.origin.elapsed())
    }

    #[must_use]
    pub fn flush_count(&self) -> usize {
        self.with_state(|s| s.flushes)
    }

    #[must_use]
    pub fn reset_count(&self) -> usize {
        self.with_state(|s| s.resets)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    #[must_use]
    pub fn context(&self) -> Option<MetricsContext> {
        self.with_state(|s| s.context.clone())
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn open(&self, ctx: &MetricsContext) -> anyhow::Result<()> {
        self.with_state(|s| {
            s.context = Some(ctx.clone());
            s.closed = false;
        });
        Ok(())
    }

    async fn bulk_add(&self, records: Vec<MetricRecord>) -> anyhow::Result<()> {
        self.with_state(|s| s.buffered.extend(records));
        Ok(())
    }

    async fn flush(&self, _refresh: bool) -> anyhow::Result<()> {
        self.with_state(|s| {
            let buffered = std::mem::take(&mut s.buffered);
            s.flushed.extend(buffered);
            s.flushes = s.flushes.saturating_add(1);
        });
        Ok(())
    }

    fn reset_relative_time(&self) {
        self.with_state(|s| {
            s.origin = Instant::now();
            s.resets = s.resets.saturating_add(1);
        });
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.with_state(|s| s.closed = true);
        Ok(())
    }

    fn records(&self) -> Vec<MetricRecord> {
        self.with_state(|s| s.flushed.iter().chain(&s.buffered).cloned().collect())
    }
}

/// Factory handing out in-memory stores. Keeps every store it created.
#[derive(Debug, Default)]
pub struct InMemoryMetricsStoreFactory {
    created: Mutex<Vec<Arc<InMemoryMetricsStore>>>,
}

impl InMemoryMetricsStoreFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores in creation order.
    #[must_use]
    pub fn stores(&self) -> Vec<Arc<InMemoryMetricsStore>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsStoreFactory for InMemoryMetricsStoreFactory {
    fn create(&self, _config: &Config) -> Arc<dyn MetricsStore> {
        let store = Arc::new(InMemoryMetricsStore::new());
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&store));
        store
    }
}

/// Everything the engine calls out to, shared by all actors of a run.
#[derive(Clone)]
pub struct Collaborators {
    pub toolkit: Arc<dyn EngineToolkit>,
    pub worker_coordinator: Arc<dyn WorkerCoordinator>,
    pub metrics: Arc<dyn MetricsStoreFactory>,
    pub results: Arc<dyn ResultsSink>,
    pub discovery: Arc<dyn DiscoveryFeed>,
    pub resolver: Arc<dyn HostResolver>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Collaborators with in-memory metrics, a logging results sink, an
    /// empty membership feed and the system resolver.
    pub fn new(
        toolkit: Arc<dyn EngineToolkit>,
        worker_coordinator: Arc<dyn WorkerCoordinator>,
    ) -> Self {
        Self {
            toolkit,
            worker_coordinator,
            metrics: Arc::new(InMemoryMetricsStoreFactory::new()),
            results: Arc::new(LoggingResultsSink),
            discovery: Arc::new(MembershipFeed::new()),
            resolver: Arc::new(SystemResolver),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsStoreFactory>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_results(mut self, results: Arc<dyn ResultsSink>) -> Self {
        self.results = results;
        self
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryFeed>) -> Self {
        self.discovery = discovery;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_keep_buffered_records_until_flush() {
        let store = InMemoryMetricsStore::new();
        let added = store
            .bulk_add(vec![MetricRecord::new("t", "latency", 1.0, "ms")])
            .await;
        assert!(added.is_ok());
        assert_eq!(store.records().len(), 1);

        let flushed = store.flush(true).await;
        assert!(flushed.is_ok());
        assert_eq!(store.flush_count(), 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_restart_relative_clock_on_reset() {
        let store = InMemoryMetricsStore::new();
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        assert!(store.relative_time() >= std::time::Duration::from_secs(10));

        store.reset_relative_time();
        assert!(store.relative_time() < std::time::Duration::from_secs(1));
        assert_eq!(store.reset_count(), 1);
    }

    #[test]
    fn should_remember_created_stores() {
        let factory = InMemoryMetricsStoreFactory::new();
        let _first = factory.create(&Config::new());
        let _second = factory.create(&Config::new());
        assert_eq!(factory.stores().len(), 2);
    }
}
