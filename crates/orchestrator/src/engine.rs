//! Supply, provision and launch for the nodes of one host.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::actors::errors::ActorError;
use crate::collaborators::{
    Binaries, EngineToolkit, Launcher, MetricsStore, NodeConfig, NodeSpec, Provisioner,
    RunningNode, Supplier,
};
use crate::context::{BuildFlavor, HostConfig};
use crate::hosts::HostEndpoint;

/// Prefix of generated node names unless configured otherwise.
pub const DEFAULT_NODE_NAME_PREFIX: &str = "benchrig-node";

/// Name of the node with `node_id`.
#[must_use]
pub fn node_name(prefix: &str, node_id: u32) -> String {
    format!("{prefix}-{node_id}")
}

/// Nodes of one host, from binary supply to process shutdown.
pub struct Engine {
    host: HostEndpoint,
    metrics: Arc<dyn MetricsStore>,
    supplier: Option<Arc<dyn Supplier>>,
    provisioners: Vec<(NodeSpec, Arc<dyn Provisioner>)>,
    launcher: Arc<dyn Launcher>,
    installed: Vec<(Arc<dyn Provisioner>, NodeConfig)>,
    nodes: Vec<RunningNode>,
    preserve_install: bool,
    stopped: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("host", &self.host)
            .field("nodes", &self.nodes)
            .field("installed", &self.installed.len())
            .field("preserve_install", &self.preserve_install)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

/// Build the engine for a host.
///
/// # Errors
///
/// Fails with `Assertion` for an externally managed cluster, with
/// `SystemSetup` for Docker clusters that request plugins, and with the
/// toolkit's error if a stage cannot be created.
pub fn create_engine(
    host: &HostConfig,
    toolkit: &dyn EngineToolkit,
    metrics: Arc<dyn MetricsStore>,
) -> anyhow::Result<Engine> {
    let config = &host.config;
    let supplier = match host.flavor {
        BuildFlavor::External => {
            return Err(ActorError::assertion(
                "Externally provisioned clusters should not need to be managed by benchrig's builder",
            )
            .into());
        }
        BuildFlavor::Docker => {
            let plugins: Vec<String> = config
                .opt_as("builder", "provision_config_instance.plugins")
                .unwrap_or_default();
            if !plugins.is_empty() {
                return Err(ActorError::system_setup(format!(
                    "Plugins {plugins:?} cannot be installed on Docker clusters. Remove them and try again."
                ))
                .into());
            }
            None
        }
        BuildFlavor::Sources | BuildFlavor::Distribution => {
            Some(toolkit.supplier(config, host.flavor)?)
        }
    };

    let prefix: String = config
        .opt_as("provisioning", "node.name.prefix")
        .unwrap_or_else(|| DEFAULT_NODE_NAME_PREFIX.to_string());
    let all_node_names: Vec<String> = host
        .all_node_ids
        .iter()
        .map(|id| node_name(&prefix, *id))
        .collect();

    let provisioners = host
        .node_ids
        .iter()
        .map(|node_id| {
            let spec = NodeSpec {
                node_id: *node_id,
                node_name: node_name(&prefix, *node_id),
                ip: host.endpoint.ip,
                http_port: host.endpoint.port,
                all_node_ips: host.all_node_ips.clone(),
                all_node_names: all_node_names.clone(),
            };
            let provisioner = toolkit.provisioner(config, host.flavor, &spec)?;
            Ok((spec, provisioner))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let launcher = toolkit.launcher(config, host.flavor)?;

    Ok(Engine {
        host: host.endpoint,
        metrics,
        supplier,
        provisioners,
        launcher,
        installed: Vec::new(),
        nodes: Vec::new(),
        preserve_install: config.opt_as("builder", "preserve.install").unwrap_or(false),
        stopped: false,
    })
}

fn stage_failed(host: HostEndpoint, stage: String) -> impl FnOnce(anyhow::Error) -> anyhow::Error {
    move |err| {
        let reason = format!("{err:#}");
        err.context(ActorError::provisioning(host.to_string(), stage, reason))
    }
}

impl Engine {
    #[must_use]
    pub fn host(&self) -> HostEndpoint {
        self.host
    }

    /// Launched nodes.
    #[must_use]
    pub fn nodes(&self) -> &[RunningNode] {
        &self.nodes
    }

    /// Whether any node was installed or launched and not yet stopped.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.stopped && !(self.installed.is_empty() && self.nodes.is_empty())
    }

    /// Supply binaries, install every node, then launch them all.
    ///
    /// # Errors
    ///
    /// Returns the first failing stage, wrapped in `Provisioning`.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let binaries = match &self.supplier {
            Some(supplier) => supplier
                .supply()
                .await
                .map_err(stage_failed(self.host, "supply binaries".to_string()))?,
            None => Binaries::default(),
        };
        debug!(host = %self.host, artifacts = binaries.artifacts.len(), "Binaries supplied");

        for (spec, provisioner) in &self.provisioners {
            let node_config = provisioner
                .prepare(&binaries)
                .await
                .map_err(stage_failed(self.host, format!("provision node [{}]", spec.node_name)))?;
            self.installed.push((Arc::clone(provisioner), node_config));
        }

        let configs: Vec<NodeConfig> = self
            .installed
            .iter()
            .map(|(_, node)| node.clone())
            .collect();
        self.nodes = self
            .launcher
            .start(&configs)
            .await
            .map_err(stage_failed(self.host, "launch nodes".to_string()))?;
        info!(host = %self.host, nodes = self.nodes.len(), "Nodes started");
        Ok(())
    }

    /// Stop processes, flush final metrics, close the store and clean up.
    ///
    /// Runs every step even if an earlier one fails, and only once.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered.
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let mut first_error: Option<anyhow::Error> = None;

        if !self.nodes.is_empty() {
            let nodes = std::mem::take(&mut self.nodes);
            if let Err(e) = self
                .launcher
                .stop(&nodes, self.metrics.as_ref())
                .await
                .with_context(|| format!("Could not stop nodes on host [{}]", self.host))
            {
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.metrics.flush(true).await {
            first_error.get_or_insert(e.context("Could not flush final metrics"));
        }
        if let Err(e) = self.metrics.close().await {
            first_error.get_or_insert(e.context("Could not close metrics store"));
        }

        for (provisioner, node) in std::mem::take(&mut self.installed) {
            if let Err(e) = provisioner.cleanup(&node, self.preserve_install).await {
                warn!(host = %self.host, node = %node.node_name, error = %e, "Cleanup failed");
                first_error.get_or_insert(
                    e.context(format!("Could not clean up node [{}]", node.node_name)),
                );
            }
        }

        debug!(host = %self.host, preserve_install = self.preserve_install, "Engine stopped");
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_name_nodes_with_prefix_and_id() {
        assert_eq!(node_name(DEFAULT_NODE_NAME_PREFIX, 3), "benchrig-node-3");
        assert_eq!(node_name("rally", 0), "rally-0");
    }
}
