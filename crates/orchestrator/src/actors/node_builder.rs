//! Node builder actor.
//!
//! Owns the nodes of exactly one host. It installs and launches them on
//! `StartNodes`, flushes their metrics on a recurring timer and tears them
//! down on `StopNodes` or when the actor itself stops.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use benchrig_core::Scope;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::collaborators::{Collaborators, MetricsStore};
use crate::context::{HostConfig, METRIC_FLUSH_INTERVAL};
use crate::engine::{Engine, create_engine};
use crate::hosts::HostEndpoint;
use crate::messaging::deliver;

use super::errors::{ActorError, FailureSignal};
use super::messages::{ClusterBuilderMessage, NodeBuilderMessage, StartNodes};

/// Arguments for spawning a node builder.
#[derive(Clone)]
pub struct NodeBuilderArguments {
    pub collaborators: Collaborators,
    pub flush_interval: Duration,
}

impl std::fmt::Debug for NodeBuilderArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilderArguments")
            .field("flush_interval", &self.flush_interval)
            .finish_non_exhaustive()
    }
}

impl NodeBuilderArguments {
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            flush_interval: METRIC_FLUSH_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

/// Lifecycle of a node builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Idle,
    /// Attached to externally managed nodes.
    Connected,
    Running,
    Failed,
    Stopped,
}

/// State for the node builder actor.
pub struct NodeBuilderState {
    collaborators: Collaborators,
    flush_interval: Duration,
    phase: NodePhase,
    host: Option<HostEndpoint>,
    metrics: Option<Arc<dyn MetricsStore>>,
    engine: Option<Engine>,
    flush_timer: Option<FlushHandle>,
}

impl NodeBuilderState {
    fn new(args: NodeBuilderArguments) -> Self {
        Self {
            collaborators: args.collaborators,
            flush_interval: args.flush_interval,
            phase: NodePhase::Idle,
            host: None,
            metrics: None,
            engine: None,
            flush_timer: None,
        }
    }

    fn host_label(&self) -> String {
        self.host
            .map_or_else(|| "unassigned".to_string(), |host| host.to_string())
    }

    fn stop_flush_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.stop();
        }
    }

    /// Open the host-scoped metrics store and launch every node.
    ///
    /// The engine is kept even when starting fails so that whatever was
    /// already installed can be cleaned up later.
    async fn launch(&mut self, mut host: HostConfig) -> anyhow::Result<()> {
        host.config.add(
            Scope::Benchmark,
            "provisioning",
            "node.ids",
            serde_json::Value::from(host.node_ids.clone()),
        );

        let metrics = self.collaborators.metrics.create(&host.config);
        metrics
            .open(&host.metrics)
            .await
            .context("Could not open metrics store")?;
        self.metrics = Some(Arc::clone(&metrics));

        let engine = create_engine(&host, self.collaborators.toolkit.as_ref(), metrics)?;
        let engine = self.engine.insert(engine);
        engine.start().await
    }

    async fn stop_engine(&mut self) -> anyhow::Result<()> {
        self.stop_flush_timer();
        let result = match self.engine.as_mut() {
            Some(engine) => engine.stop().await,
            None => match &self.metrics {
                Some(metrics) => metrics.close().await,
                None => Ok(()),
            },
        };
        self.engine = None;
        self.metrics = None;
        result
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NodeBuilderActorDef;

impl Actor for NodeBuilderActorDef {
    type Msg = NodeBuilderMessage;
    type State = NodeBuilderState;
    type Arguments = NodeBuilderArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(actor = %myself.get_id(), "Node builder starting");
        Ok(NodeBuilderState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            NodeBuilderMessage::StartNodes(start) => {
                let StartNodes { host, reply_to } = *start;
                if state.phase != NodePhase::Idle {
                    warn!(
                        host = %host.endpoint,
                        phase = ?state.phase,
                        "Ignoring repeated request to start nodes"
                    );
                    return Ok(());
                }
                let endpoint = host.endpoint;
                state.host = Some(endpoint);

                if host.is_externally_managed() {
                    info!(host = %endpoint, "Connecting to externally provisioned nodes");
                    state.phase = NodePhase::Connected;
                    deliver(
                        &reply_to,
                        ClusterBuilderMessage::NodesStarted {
                            worker: myself.clone(),
                            host: endpoint,
                        },
                    )?;
                    return Ok(());
                }

                info!(host = %endpoint, node_ids = ?host.node_ids, flavor = %host.flavor, "Starting nodes");
                match state.launch(host).await {
                    Ok(()) => {
                        state.phase = NodePhase::Running;
                        state.flush_timer =
                            Some(FlushTimer::start(myself.clone(), state.flush_interval));
                        deliver(
                            &reply_to,
                            ClusterBuilderMessage::NodesStarted {
                                worker: myself.clone(),
                                host: endpoint,
                            },
                        )?;
                    }
                    Err(err) => {
                        state.phase = NodePhase::Failed;
                        let failure =
                            FailureSignal::from_error(format!("Error on host [{endpoint}]"), &err);
                        error!(host = %endpoint, error = %failure, "Could not start nodes");
                        deliver(
                            &reply_to,
                            ClusterBuilderMessage::BenchmarkFailure {
                                failure,
                                worker: Some(myself.get_id()),
                            },
                        )?;
                    }
                }
            }
            NodeBuilderMessage::FlushMetrics => {
                if let Some(metrics) = &state.metrics {
                    if let Err(e) = metrics.flush(false).await {
                        warn!(host = %state.host_label(), error = %e, "Could not flush metrics");
                    }
                }
            }
            NodeBuilderMessage::ResetRelativeTime => match &state.metrics {
                Some(metrics) => {
                    debug!(host = %state.host_label(), "Resetting relative time");
                    metrics.reset_relative_time();
                }
                None => debug!(phase = ?state.phase, "No metrics store to reset"),
            },
            NodeBuilderMessage::StopNodes { reply_to } => {
                let host = state.host_label();
                info!(host = %host, phase = ?state.phase, "Stopping nodes");
                let result = state.stop_engine().await;
                state.phase = NodePhase::Stopped;
                let reply = match result {
                    Ok(()) => ClusterBuilderMessage::NodesStopped {
                        worker: myself.get_id(),
                    },
                    Err(err) => {
                        let failure =
                            FailureSignal::from_error(format!("Error on host [{host}]"), &err);
                        error!(host = %host, error = %failure, "Could not stop nodes");
                        ClusterBuilderMessage::BenchmarkFailure {
                            failure,
                            worker: Some(myself.get_id()),
                        }
                    }
                };
                deliver(&reply_to, reply)?;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let still_running = state.engine.as_ref().is_some_and(Engine::is_active);
        if still_running {
            warn!(host = %state.host_label(), "Node builder exiting with nodes still running, stopping them");
        }
        if let Err(e) = state.stop_engine().await {
            warn!(host = %state.host_label(), error = %e, "Best-effort node shutdown failed");
        }
        debug!(host = %state.host_label(), "Node builder stopped");
        Ok(())
    }
}

/// Spawn a node builder.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor cannot be started.
pub async fn spawn_node_builder(
    args: NodeBuilderArguments,
) -> Result<(ActorRef<NodeBuilderMessage>, JoinHandle<()>), ActorError> {
    Actor::spawn(None, NodeBuilderActorDef, args)
        .await
        .map_err(|e| ActorError::spawn_failed(format!("Failed to spawn node builder: {e}")))
}

/// Stops a running [`FlushTimer`]. Dropping the handle stops it as well.
#[derive(Debug)]
pub struct FlushHandle {
    stop_tx: watch::Sender<bool>,
}

impl FlushHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sends `FlushMetrics` to a node builder at a fixed interval.
///
/// The first tick fires one interval after start.
#[derive(Clone, Copy, Debug)]
pub struct FlushTimer;

impl FlushTimer {
    pub fn start(target: ActorRef<NodeBuilderMessage>, interval: Duration) -> FlushHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if target.send_message(NodeBuilderMessage::FlushMetrics).is_err() {
                            break;
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        FlushHandle { stop_tx }
    }
}
