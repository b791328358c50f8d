//! Run configuration handed down the actor tree.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use benchrig_core::{Config, Result as CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hosts::HostEndpoint;

/// Sections copied into the configuration a node builder receives.
pub const HOST_LOCAL_SECTIONS: &[&str] = &[
    "workload",
    "builder",
    "client",
    "telemetry",
    "test_execution",
    "source",
    "provisioning",
];

/// Default interval between metrics flushes on a node builder.
pub const METRIC_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// How the benchmark candidate gets onto the target hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildFlavor {
    /// Built from source, then provisioned.
    Sources,
    /// Downloaded release distribution, then provisioned.
    Distribution,
    /// An already running cluster that benchrig does not manage.
    External,
    /// Official container image.
    Docker,
}

impl BuildFlavor {
    #[must_use]
    pub fn is_externally_managed(self) -> bool {
        matches!(self, Self::External)
    }
}

impl fmt::Display for BuildFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sources => write!(f, "sources"),
            Self::Distribution => write!(f, "distribution"),
            Self::External => write!(f, "external"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// The workload and test procedure a run executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSelection {
    pub name: String,
    pub test_procedure: Option<String>,
    pub revision: Option<String>,
}

impl WorkloadSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            test_procedure: None,
            revision: None,
        }
    }

    #[must_use]
    pub fn with_test_procedure(mut self, test_procedure: impl Into<String>) -> Self {
        self.test_procedure = Some(test_procedure.into());
        self
    }

    /// Read the selection from the `workload` section.
    ///
    /// # Errors
    ///
    /// Returns an error if `workload.workload.name` is missing.
    pub fn from_config(config: &Config) -> CoreResult<Self> {
        Ok(Self {
            name: config.opts("workload", "workload.name")?,
            test_procedure: config.opt_as("workload", "test_procedure.name"),
            revision: config.opt_as("workload", "repository.revision"),
        })
    }
}

/// Identity a metrics store session is opened with.
///
/// Every node builder opens its own store with the same context so records
/// from all hosts belong to one test execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsContext {
    pub test_execution_id: Uuid,
    pub test_execution_timestamp: DateTime<Utc>,
    pub workload: String,
    pub test_procedure: Option<String>,
    pub provision_config_instance: Vec<String>,
}

impl MetricsContext {
    /// Build the context for a new test execution.
    ///
    /// Uses `system.test_execution.id` when it holds a UUID, otherwise
    /// generates one.
    #[must_use]
    pub fn for_run(config: &Config, workload: &WorkloadSelection) -> Self {
        let test_execution_id = config
            .opt_as::<String>("system", "test_execution.id")
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .unwrap_or_else(Uuid::new_v4);
        Self {
            test_execution_id,
            test_execution_timestamp: Utc::now(),
            workload: workload.name.clone(),
            test_procedure: workload.test_procedure.clone(),
            provision_config_instance: config
                .opt_as("builder", "provision_config_instance.names")
                .unwrap_or_default(),
        }
    }
}

/// Full configuration snapshot for one invocation.
///
/// Never mutated after it has been sent; each actor works on its own clone.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Config,
    pub flavor: BuildFlavor,
    pub workload: WorkloadSelection,
    pub metrics: MetricsContext,
}

impl RunContext {
    pub fn new(config: Config, flavor: BuildFlavor, workload: WorkloadSelection) -> Self {
        let metrics = MetricsContext::for_run(&config, &workload);
        Self {
            config,
            flavor,
            workload,
            metrics,
        }
    }

    /// Derive a context from configuration alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the workload selection is incomplete.
    pub fn from_config(config: Config, flavor: BuildFlavor) -> CoreResult<Self> {
        let workload = WorkloadSelection::from_config(&config)?;
        Ok(Self::new(config, flavor, workload))
    }

    #[must_use]
    pub fn is_externally_managed(&self) -> bool {
        self.flavor.is_externally_managed()
    }
}

/// Everything one node builder needs to start the nodes on its host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Host-local slice of the run configuration.
    pub config: Config,
    pub metrics: MetricsContext,
    pub flavor: BuildFlavor,
    pub endpoint: HostEndpoint,
    /// Nodes to start on this host.
    pub node_ids: Vec<u32>,
    /// Addresses of every host in the cluster, this one included.
    pub all_node_ips: Vec<IpAddr>,
    /// Ids of every node in the cluster, this host's included.
    pub all_node_ids: Vec<u32>,
}

impl HostConfig {
    #[must_use]
    pub fn is_externally_managed(&self) -> bool {
        self.flavor.is_externally_managed()
    }
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Interval between metrics flushes on each node builder.
    pub metrics_flush_interval: Duration,
    /// Fail the run if remote hosts are not all reachable in time.
    /// `None` waits indefinitely.
    pub remote_wait_timeout: Option<Duration>,
    /// Upper bound for a parent waiting on its children to stop.
    pub teardown_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            metrics_flush_interval: METRIC_FLUSH_INTERVAL,
            remote_wait_timeout: None,
            teardown_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineSettings {
    /// Settings for tests with short intervals.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            metrics_flush_interval: Duration::from_millis(50),
            remote_wait_timeout: None,
            teardown_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_metrics_flush_interval(mut self, interval: Duration) -> Self {
        self.metrics_flush_interval = interval;
        self
    }

    #[must_use]
    pub fn with_remote_wait_timeout(mut self, timeout: Duration) -> Self {
        self.remote_wait_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }
}
