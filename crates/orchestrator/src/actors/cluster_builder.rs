//! Cluster builder supervisor.
//!
//! Owns every node builder of one run. Start and stop are fan-out
//! transitions: the supervisor fixes the number of expected responses when
//! it fans out, then aggregates `NodesStarted` / `NodesStopped` by responder
//! identity, in whatever order they arrive. Failures from below are forwarded
//! to the benchmark orchestrator once; while the cluster is being torn down
//! they are expected and only logged.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::Collaborators;
use crate::context::{EngineSettings, RunContext};
use crate::hosts::{HostEndpoint, hosts_from_config, nodes_by_host, to_ip_port};
use crate::messaging::deliver;

use super::dispatcher::{DispatcherArguments, spawn_dispatcher};
use super::errors::{ActorError, FailureSignal};
use super::messages::{
    BenchmarkMessage, ChildExit, ChildRole, ClusterBuilderMessage, ClusterStatus,
    DispatcherMessage, NodeBuilderMessage,
};
use super::pending::{PendingResponses, Recorded};
use super::supervision::{Supervised, supervise};

/// Status of the cluster a supervisor manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    ClusterStarted,
    ClusterStopping,
    ClusterStopped,
    Failed,
}

impl RunState {
    /// Whether failures and exits are expected noise in this state.
    #[must_use]
    pub fn is_tearing_down(self) -> bool {
        matches!(self, Self::ClusterStopping | Self::ClusterStopped)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::ClusterStarted => write!(f, "cluster_started"),
            Self::ClusterStopping => write!(f, "cluster_stopping"),
            Self::ClusterStopped => write!(f, "cluster_stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Arguments for spawning a cluster builder.
#[derive(Clone)]
pub struct ClusterBuilderArguments {
    pub collaborators: Collaborators,
    pub settings: EngineSettings,
}

impl ClusterBuilderArguments {
    #[must_use]
    pub fn new(collaborators: Collaborators, settings: EngineSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }
}

impl fmt::Debug for ClusterBuilderArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBuilderArguments")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// State for the cluster builder actor.
pub struct ClusterBuilderState {
    collaborators: Collaborators,
    settings: EngineSettings,
    status: RunState,
    requester: Option<ActorRef<BenchmarkMessage>>,
    externally_managed: bool,
    revision: Option<String>,
    pending: PendingResponses<ActorId>,
    /// Node builders told to stop in the current teardown.
    stop_targets: HashSet<ActorId>,
    workers: HashMap<ActorId, (ActorRef<NodeBuilderMessage>, HostEndpoint)>,
    dispatcher: Option<Supervised<DispatcherMessage>>,
    reset_timer: Option<JoinHandle<()>>,
    failure_reported: bool,
}

impl ClusterBuilderState {
    fn new(args: ClusterBuilderArguments) -> Self {
        Self {
            collaborators: args.collaborators,
            settings: args.settings,
            status: RunState::Idle,
            requester: None,
            externally_managed: false,
            revision: None,
            pending: PendingResponses::new(0),
            stop_targets: HashSet::new(),
            workers: HashMap::new(),
            dispatcher: None,
            reset_timer: None,
            failure_reported: false,
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.status != next {
            info!(from = %self.status, to = %next, "Cluster state changed");
            self.status = next;
        }
    }

    fn reply(&self, message: BenchmarkMessage) {
        match &self.requester {
            Some(requester) => {
                if let Err(e) = deliver(requester, message) {
                    warn!(error = %e, "Could not reply to benchmark orchestrator");
                }
            }
            None => warn!(kind = ?message, "No requester to reply to"),
        }
    }

    /// Forward a failure to the orchestrator, once per run.
    fn escalate(&mut self, failure: FailureSignal) {
        if self.failure_reported {
            debug!(error = %failure, "Failure already reported, not forwarding again");
            return;
        }
        error!(status = %self.status, error = %failure, "Escalating failure");
        self.failure_reported = true;
        self.reply(BenchmarkMessage::BenchmarkFailure(failure));
    }

    fn broadcast_reset(&self) {
        debug!(workers = self.workers.len(), "Resetting relative time on all nodes");
        for (worker, _) in self.workers.values() {
            let _ = deliver(worker, NodeBuilderMessage::ResetRelativeTime);
        }
    }

    fn cancel_reset_timer(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }

    /// Release node builders and the dispatcher. Handles are never reused.
    fn release(&mut self) {
        for (_, (worker, _)) in self.workers.drain() {
            worker.stop(Some("cluster stopped".to_string()));
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.stop("cluster stopped");
        }
    }

    fn status(&self) -> ClusterStatus {
        ClusterStatus {
            state: self.status,
            externally_managed: self.externally_managed,
            workers: self.workers.len(),
            awaiting: self.pending.remaining(),
        }
    }

    async fn start_engine(
        &mut self,
        myself: &ActorRef<ClusterBuilderMessage>,
        ctx: Box<RunContext>,
    ) -> Result<(), ActorError> {
        let hosts = hosts_from_config(&ctx.config)?;
        if hosts.is_empty() {
            return Err(ActorError::launch("No target hosts are configured."));
        }
        self.collaborators
            .results
            .notice("Preparing for test execution ...");

        let endpoints = to_ip_port(&hosts, self.collaborators.resolver.as_ref()).await?;
        let assignment = nodes_by_host(&endpoints);
        self.pending = PendingResponses::new(assignment.len());
        info!(
            hosts = assignment.len(),
            nodes = endpoints.len(),
            "Starting benchmark candidate"
        );

        let args = DispatcherArguments {
            collaborators: self.collaborators.clone(),
            settings: self.settings.clone(),
        };
        let (dispatcher, handle) = spawn_dispatcher(args).await?;
        let supervisor = myself.clone();
        let dispatcher = supervise(dispatcher, handle, ChildRole::Dispatcher, move |exit| {
            let _ = supervisor.send_message(ClusterBuilderMessage::ChildExited(exit));
        });

        let start = DispatcherMessage::StartEngine {
            ctx,
            assignment,
            reply_to: myself.clone(),
        };
        let delivered = deliver(dispatcher.actor(), start);
        self.dispatcher = Some(dispatcher);
        delivered.map_err(|_| {
            ActorError::launch(
                "Could not start benchmark candidate. Are benchrig daemons on all targeted machines running?",
            )
        })?;
        self.transition(RunState::Starting);
        Ok(())
    }

    fn nodes_started(&mut self, worker: ActorRef<NodeBuilderMessage>, host: HostEndpoint) {
        let id = worker.get_id();
        match self.status {
            RunState::Starting => {
                self.workers.insert(id, (worker, host));
                match self.pending.record(id) {
                    Recorded::New => {
                        debug!(host = %host, remaining = self.pending.remaining(), "Nodes started");
                        if self.pending.is_complete() {
                            self.transition(RunState::ClusterStarted);
                            self.reply(BenchmarkMessage::EngineStarted {
                                provision_config_revision: self.revision.clone(),
                            });
                        }
                    }
                    Recorded::Duplicate => debug!(host = %host, "Duplicate NodesStarted ignored"),
                    Recorded::Excess => warn!(host = %host, "Unexpected NodesStarted ignored"),
                }
            }
            RunState::Failed => {
                debug!(host = %host, "Nodes started after failure, keeping them for teardown");
                self.workers.insert(id, (worker, host));
            }
            RunState::ClusterStopping | RunState::ClusterStopped => {
                info!(host = %host, status = %self.status, "Nodes started during teardown, stopping them");
                worker.stop(Some("cluster stopping".to_string()));
            }
            RunState::Idle | RunState::ClusterStarted => {
                if !self.workers.contains_key(&id) {
                    warn!(host = %host, status = %self.status, "Ignoring unexpected NodesStarted");
                }
            }
        }
    }

    fn stop_engine(&mut self, myself: &ActorRef<ClusterBuilderMessage>) {
        if self.status.is_tearing_down() {
            debug!(status = %self.status, "Ignoring repeated StopEngine");
            return;
        }
        self.cancel_reset_timer();
        if self.externally_managed {
            self.transition(RunState::ClusterStopped);
            self.reply(BenchmarkMessage::EngineStopped);
            return;
        }

        self.transition(RunState::ClusterStopping);
        self.pending = PendingResponses::new(self.workers.len());
        self.stop_targets = self.workers.keys().copied().collect();
        info!(workers = self.workers.len(), "Stopping benchmark candidate");
        let unreachable: Vec<ActorId> = self
            .workers
            .iter()
            .filter_map(|(id, (worker, host))| {
                let stop = NodeBuilderMessage::StopNodes {
                    reply_to: myself.clone(),
                };
                match deliver(worker, stop) {
                    Ok(()) => None,
                    Err(e) => {
                        info!(host = %host, error = %e, "Node builder already gone, treating as stopped");
                        Some(*id)
                    }
                }
            })
            .collect();
        for id in unreachable {
            self.pending.record(id);
        }
        self.finish_stop_if_complete();
    }

    fn node_stopped(&mut self, worker: ActorId) {
        if self.status != RunState::ClusterStopping {
            debug!(worker = %worker, status = %self.status, "Ignoring NodesStopped");
            return;
        }
        if !self.stop_targets.contains(&worker) {
            debug!(worker = %worker, "Ignoring NodesStopped from a node builder that was not asked to stop");
            return;
        }
        if self.pending.record(worker) == Recorded::New {
            debug!(worker = %worker, remaining = self.pending.remaining(), "Nodes stopped");
        }
        self.finish_stop_if_complete();
    }

    fn finish_stop_if_complete(&mut self) {
        if self.status == RunState::ClusterStopping && self.pending.is_complete() {
            self.transition(RunState::ClusterStopped);
            self.reply(BenchmarkMessage::EngineStopped);
            self.release();
        }
    }

    fn failure(&mut self, failure: FailureSignal, worker: Option<ActorId>) {
        match self.status {
            RunState::ClusterStopping => {
                self.escalate(failure);
                if let Some(id) = worker {
                    self.node_stopped(id);
                }
            }
            RunState::ClusterStopped => {
                info!(error = %failure, "Ignoring failure after the cluster has stopped");
            }
            _ => {
                self.escalate(failure);
                self.transition(RunState::Failed);
            }
        }
    }

    fn child_exited(&mut self, exit: ChildExit) {
        if exit.role == ChildRole::NodeBuilder {
            self.workers.remove(&exit.id);
        }
        match self.status {
            RunState::ClusterStopping => {
                info!(child = %exit, "Child exited while stopping");
                if exit.role == ChildRole::NodeBuilder {
                    self.node_stopped(exit.id);
                }
            }
            RunState::ClusterStopped => info!(child = %exit, "Child exited"),
            _ => {
                let failure = FailureSignal::new(format!(
                    "Child actor exited with [{}] while in status [{}].",
                    exit.reason, self.status
                ));
                self.escalate(failure);
                self.transition(RunState::Failed);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterBuilderActorDef;

impl Actor for ClusterBuilderActorDef {
    type Msg = ClusterBuilderMessage;
    type State = ClusterBuilderState;
    type Arguments = ClusterBuilderArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(actor = %myself.get_id(), "Cluster builder starting");
        Ok(ClusterBuilderState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ClusterBuilderMessage::StartEngine {
                ctx,
                externally_managed,
                reply_to,
            } => {
                if !matches!(state.status, RunState::Idle | RunState::ClusterStopped) {
                    warn!(status = %state.status, "Ignoring StartEngine for an active cluster");
                    return Ok(());
                }
                state.requester = Some(reply_to);
                state.externally_managed = externally_managed;
                state.failure_reported = false;
                state.revision = ctx.config.opt_as("builder", "repository.revision");

                if externally_managed {
                    info!("Cluster is externally managed, no nodes to start");
                    state.transition(RunState::ClusterStarted);
                    state.reply(BenchmarkMessage::EngineStarted {
                        provision_config_revision: state.revision.clone(),
                    });
                    return Ok(());
                }
                if let Err(e) = state.start_engine(&myself, ctx).await {
                    state.failure(FailureSignal::from_actor_error(&e), None);
                }
            }
            ClusterBuilderMessage::NodesStarted { worker, host } => {
                state.nodes_started(worker, host);
            }
            ClusterBuilderMessage::ResetRelativeTime { delay } => {
                if delay.is_zero() {
                    state.broadcast_reset();
                } else {
                    state.cancel_reset_timer();
                    let target = myself.clone();
                    debug!(delay_ms = delay.as_millis(), "Scheduling relative time reset");
                    state.reset_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = target.send_message(ClusterBuilderMessage::WakeupResetRelativeTime);
                    }));
                }
            }
            ClusterBuilderMessage::WakeupResetRelativeTime => {
                state.reset_timer = None;
                state.broadcast_reset();
            }
            ClusterBuilderMessage::StopEngine => state.stop_engine(&myself),
            ClusterBuilderMessage::NodesStopped { worker } => state.node_stopped(worker),
            ClusterBuilderMessage::BenchmarkFailure { failure, worker } => {
                state.failure(failure, worker);
            }
            ClusterBuilderMessage::ChildExited(exit) => state.child_exited(exit),
            ClusterBuilderMessage::GetStatus { reply } => {
                let _ = reply.send(state.status());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.cancel_reset_timer();
        state.release();
        if let Some(dispatcher) = state.dispatcher.take() {
            dispatcher
                .stop_and_wait("cluster builder stopping", state.settings.teardown_timeout)
                .await;
        }
        debug!(status = %state.status, "Cluster builder stopped");
        Ok(())
    }
}

/// Spawn a cluster builder.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor cannot be started.
pub async fn spawn_cluster_builder(
    args: ClusterBuilderArguments,
) -> Result<(ActorRef<ClusterBuilderMessage>, JoinHandle<()>), ActorError> {
    Actor::spawn(None, ClusterBuilderActorDef, args)
        .await
        .map_err(|e| ActorError::spawn_failed(format!("Failed to spawn cluster builder: {e}")))
}

/// Query a cluster builder's status.
///
/// # Errors
///
/// Returns `RpcTimeout` if no answer arrives within `timeout`, or
/// `ActorUnavailable` if the actor is gone.
pub async fn cluster_status(
    actor: &ActorRef<ClusterBuilderMessage>,
    timeout: Duration,
) -> Result<ClusterStatus, ActorError> {
    match actor
        .call(|reply| ClusterBuilderMessage::GetStatus { reply }, Some(timeout))
        .await
    {
        Ok(CallResult::Success(status)) => Ok(status),
        Ok(CallResult::Timeout) => Err(ActorError::rpc_timeout(timeout)),
        Ok(CallResult::SenderError) | Err(_) => Err(ActorError::ActorUnavailable),
    }
}
