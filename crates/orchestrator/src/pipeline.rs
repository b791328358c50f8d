//! Named ways of getting a benchmark candidate onto the target hosts.

use std::fmt;

use benchrig_core::{Config, Scope};
use tracing::{info, warn};

use crate::actors::errors::ActorError;
use crate::actors::{BenchmarkOutcome, run_benchmark};
use crate::collaborators::Collaborators;
use crate::context::{BuildFlavor, EngineSettings, RunContext};
use crate::hosts::DEFAULT_PORT;

/// Environment variable set by the benchrig Docker image.
pub const RUNNING_IN_DOCKER_ENV: &str = "BENCHRIG_RUNNING_IN_DOCKER";

/// Whether this process runs inside the benchrig Docker image.
#[must_use]
pub fn running_in_docker() -> bool {
    std::env::var(RUNNING_IN_DOCKER_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("true"))
}

/// A named pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    name: &'static str,
    description: &'static str,
    flavor: BuildFlavor,
    stable: bool,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.description)
    }
}

/// Add `127.0.0.1:<port>` as the only target host unless hosts are configured.
fn set_default_hosts(config: &mut Config, port: u16) {
    let configured = config
        .opt("client", "hosts")
        .and_then(|hosts| hosts.as_array())
        .is_some_and(|hosts| !hosts.is_empty());
    if !configured {
        let host = format!("127.0.0.1:{port}");
        info!(host = %host, "Using default target host");
        config.add(
            Scope::ApplicationOverride,
            "client",
            "hosts",
            serde_json::json!([host]),
        );
    }
}

impl Pipeline {
    #[must_use]
    pub const fn new(
        name: &'static str,
        description: &'static str,
        flavor: BuildFlavor,
        stable: bool,
    ) -> Self {
        Self {
            name,
            description,
            flavor,
            stable,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        self.description
    }

    #[must_use]
    pub fn flavor(&self) -> BuildFlavor {
        self.flavor
    }

    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.stable
    }

    /// Apply the pipeline's configuration defaults.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `provisioning.node.http.port` is not a port.
    pub fn prepare(&self, config: &mut Config) -> Result<(), ActorError> {
        match self.flavor {
            BuildFlavor::Sources | BuildFlavor::Distribution => {
                let port = config.opts_or("provisioning", "node.http.port", DEFAULT_PORT)?;
                set_default_hosts(config, port);
            }
            BuildFlavor::External => {
                set_default_hosts(config, DEFAULT_PORT);
                config.add(
                    Scope::Benchmark,
                    "builder",
                    "provision_config_instance.names",
                    serde_json::json!(["external"]),
                );
            }
            BuildFlavor::Docker => set_default_hosts(config, DEFAULT_PORT),
        }
        Ok(())
    }

    /// Prepare the configuration and run a benchmark with it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is incomplete or the run could
    /// not begin. A failed run is reported through the outcome.
    pub async fn run(
        &self,
        mut config: Config,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Result<BenchmarkOutcome, ActorError> {
        if !self.stable {
            warn!(pipeline = self.name, "Pipeline is experimental and may change without notice");
        }
        self.prepare(&mut config)?;
        let ctx = RunContext::from_config(config, self.flavor)?;
        info!(pipeline = self.name, flavor = %self.flavor, "Running pipeline");
        run_benchmark(ctx, collaborators, settings).await
    }
}

/// All known pipelines.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: Vec<Pipeline>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self {
            pipelines: vec![
                Pipeline::new(
                    "from-sources",
                    "Builds and provisions the benchmark candidate from sources, then benchmarks it.",
                    BuildFlavor::Sources,
                    true,
                ),
                Pipeline::new(
                    "from-distribution",
                    "Downloads a release distribution, provisions it, then benchmarks it.",
                    BuildFlavor::Distribution,
                    true,
                ),
                Pipeline::new(
                    "benchmark-only",
                    "Benchmarks an already running cluster without managing it.",
                    BuildFlavor::External,
                    true,
                ),
                Pipeline::new(
                    "docker",
                    "Runs the official container image, then benchmarks it.",
                    BuildFlavor::Docker,
                    false,
                ),
            ],
        }
    }
}

impl PipelineRegistry {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Stable pipelines, in registration order.
    #[must_use]
    pub fn available(&self) -> Vec<&Pipeline> {
        self.pipelines.iter().filter(|p| p.stable).collect()
    }

    /// Resolve the pipeline for `config` and record the choice in it.
    ///
    /// # Errors
    ///
    /// See [`Self::select_with`].
    pub fn select(&self, config: &mut Config) -> Result<&Pipeline, ActorError> {
        self.select_with(config, running_in_docker())
    }

    /// Resolve the pipeline named by `test_execution.pipeline`.
    ///
    /// Without a name, `from-distribution` is chosen if a distribution
    /// version is configured, `benchmark-only` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `SystemSetup` for unknown pipelines, and for anything but
    /// `benchmark-only` when `in_docker` is set.
    pub fn select_with(&self, config: &mut Config, in_docker: bool) -> Result<&Pipeline, ActorError> {
        let name = config
            .opt_as::<String>("test_execution", "pipeline")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                if config.exists("builder", "distribution.version") {
                    "from-distribution".to_string()
                } else {
                    "benchmark-only".to_string()
                }
            });

        if in_docker && name != "benchmark-only" {
            return Err(ActorError::system_setup(format!(
                "Only the [benchmark-only] pipeline is supported by the benchrig Docker image, not [{name}]. \
                 Add --pipeline=benchmark-only to your benchrig arguments and try again."
            )));
        }

        let pipeline = self.get(&name).ok_or_else(|| {
            ActorError::system_setup(format!(
                "Unknown pipeline [{name}]. List the available pipelines with [benchrig list pipelines]."
            ))
        })?;
        config.add(Scope::ApplicationOverride, "test_execution", "pipeline", name);
        Ok(pipeline)
    }
}
