//! Host dispatcher actor.
//!
//! Fans a resolved [`NodeAssignment`] out to one node builder per host.
//! Local hosts get their node builder right away. Startup requests for
//! remote hosts are buffered per address until the membership feed reports
//! the address as reachable. Only when every host has a node builder are the
//! buffered `StartNodes` commands sent, each exactly once.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::Collaborators;
use crate::context::{EngineSettings, HOST_LOCAL_SECTIONS, HostConfig, RunContext};
use crate::discovery::{DiscoveryFeed, HostAvailability, MembershipSubscription};
use crate::hosts::NodeAssignment;
use crate::messaging::deliver;

use super::errors::{ActorError, FailureSignal};
use super::messages::{
    ChildRole, ClusterBuilderMessage, DispatcherMessage, NodeBuilderMessage, StartNodes,
};
use super::node_builder::{NodeBuilderArguments, spawn_node_builder};
use super::supervision::{Supervised, stop_all_and_wait, supervise};

/// Arguments for spawning a dispatcher.
#[derive(Clone)]
pub struct DispatcherArguments {
    pub collaborators: Collaborators,
    pub settings: EngineSettings,
}

impl std::fmt::Debug for DispatcherArguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherArguments")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// State for the dispatcher actor.
pub struct DispatcherState {
    collaborators: Collaborators,
    settings: EngineSettings,
    requester: Option<ActorRef<ClusterBuilderMessage>>,
    workers: Vec<Supervised<NodeBuilderMessage>>,
    /// Startup requests per remote address not yet reachable.
    awaiting: HashMap<IpAddr, Vec<StartNodes>>,
    /// Node builders created but not yet told to start.
    pending: Vec<(ActorRef<NodeBuilderMessage>, StartNodes)>,
    forwarder: Option<JoinHandle<()>>,
    wait_timer: Option<JoinHandle<()>>,
    gave_up: bool,
}

impl DispatcherState {
    fn new(args: DispatcherArguments) -> Self {
        Self {
            collaborators: args.collaborators,
            settings: args.settings,
            requester: None,
            workers: Vec::new(),
            awaiting: HashMap::new(),
            pending: Vec::new(),
            forwarder: None,
            wait_timer: None,
            gave_up: false,
        }
    }

    fn report_failure(&self, failure: FailureSignal) {
        error!(error = %failure, "Dispatcher failure");
        if let Some(requester) = &self.requester {
            let _ = deliver(
                requester,
                ClusterBuilderMessage::BenchmarkFailure {
                    failure,
                    worker: None,
                },
            );
        }
    }

    /// Stop listening for membership changes.
    fn stop_waiting(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(timer) = self.wait_timer.take() {
            timer.abort();
        }
    }

    async fn spawn_worker(&mut self) -> Result<ActorRef<NodeBuilderMessage>, ActorError> {
        let args = NodeBuilderArguments::new(self.collaborators.clone())
            .with_flush_interval(self.settings.metrics_flush_interval);
        let (worker, handle) = spawn_node_builder(args).await?;
        let requester = self.requester.clone();
        let supervised = supervise(worker.clone(), handle, ChildRole::NodeBuilder, move |exit| {
            if let Some(requester) = requester {
                let _ = requester.send_message(ClusterBuilderMessage::ChildExited(exit));
            }
        });
        self.workers.push(supervised);
        Ok(worker)
    }

    /// Create node builders for everything buffered for `address`.
    async fn host_reachable(&mut self, address: IpAddr) -> Result<(), ActorError> {
        let Some(requests) = self.awaiting.remove(&address) else {
            debug!(address = %address, "Ignoring reachability of a host nobody waits for");
            return Ok(());
        };
        info!(address = %address, nodes = requests.len(), "Remote host became reachable");
        for request in requests {
            let worker = self.spawn_worker().await?;
            self.pending.push((worker, request));
        }
        Ok(())
    }

    /// Send every pending `StartNodes` once all hosts have a node builder.
    fn flush_if_ready(&mut self) {
        if !self.awaiting.is_empty() || self.gave_up {
            return;
        }
        self.stop_waiting();
        let pending = std::mem::take(&mut self.pending);
        info!(workers = pending.len(), "All hosts available, starting nodes");
        for (worker, request) in pending {
            if let Err(e) = deliver(&worker, NodeBuilderMessage::StartNodes(Box::new(request))) {
                self.report_failure(FailureSignal::from_actor_error(&e));
            }
        }
    }

    fn start_forwarding(
        &mut self,
        myself: &ActorRef<DispatcherMessage>,
        subscription: MembershipSubscription,
    ) {
        let target = myself.clone();
        let discovery: Arc<dyn DiscoveryFeed> = Arc::clone(&self.collaborators.discovery);
        let mut updates = subscription.updates;
        self.forwarder = Some(tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(event) => {
                        if target
                            .send_message(DispatcherMessage::HostAvailabilityChanged(event))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Membership updates lagged, resending reachable hosts");
                        for address in discovery.reachable() {
                            let event = HostAvailability::reachable(address);
                            if target
                                .send_message(DispatcherMessage::HostAvailabilityChanged(event))
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        if let Some(timeout) = self.settings.remote_wait_timeout {
            let target = myself.clone();
            self.wait_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = target.send_message(DispatcherMessage::RemoteWaitExpired);
            }));
        }
    }

    async fn start_engine(
        &mut self,
        myself: &ActorRef<DispatcherMessage>,
        ctx: &RunContext,
        assignment: &NodeAssignment,
    ) -> Result<(), ActorError> {
        let config = ctx.config.filtered(HOST_LOCAL_SECTIONS);
        let all_node_ips = assignment.all_node_ips();
        let all_node_ids = assignment.all_node_ids();
        let request_for = |endpoint, node_ids: Vec<u32>, reply_to| StartNodes {
            host: HostConfig {
                config: config.clone(),
                metrics: ctx.metrics.clone(),
                flavor: ctx.flavor,
                endpoint,
                node_ids,
                all_node_ips: all_node_ips.clone(),
                all_node_ids: all_node_ids.clone(),
            },
            reply_to,
        };

        let Some(requester) = self.requester.clone() else {
            return Err(ActorError::assertion("StartEngine without a requester"));
        };
        let (local, remote) = assignment.partition();
        debug!(local = local.len(), remote = remote.len(), "Partitioned target hosts");

        for (endpoint, node_ids) in local {
            let worker = self.spawn_worker().await?;
            self.pending
                .push((worker, request_for(endpoint, node_ids, requester.clone())));
        }
        for (endpoint, node_ids) in remote {
            self.awaiting
                .entry(endpoint.ip)
                .or_default()
                .push(request_for(endpoint, node_ids, requester.clone()));
        }

        if !self.awaiting.is_empty() {
            let subscription = self.collaborators.discovery.subscribe();
            info!(
                awaiting = ?self.awaiting.keys().collect::<Vec<_>>(),
                "Waiting for remote hosts to become reachable"
            );
            let already_reachable = subscription.reachable.clone();
            self.start_forwarding(myself, subscription);
            for address in already_reachable {
                self.host_reachable(address).await?;
            }
        }
        self.flush_if_ready();
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DispatcherActorDef;

impl Actor for DispatcherActorDef {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(actor = %myself.get_id(), "Dispatcher starting");
        Ok(DispatcherState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::StartEngine {
                ctx,
                assignment,
                reply_to,
            } => {
                if state.requester.is_some() {
                    warn!("Ignoring repeated StartEngine");
                    return Ok(());
                }
                state.requester = Some(reply_to);
                if let Err(e) = state.start_engine(&myself, &ctx, &assignment).await {
                    state.stop_waiting();
                    state.gave_up = true;
                    state.report_failure(FailureSignal::from_actor_error(&e));
                }
            }
            DispatcherMessage::HostAvailabilityChanged(event) => {
                if state.gave_up {
                    debug!(address = %event.address, "Ignoring membership change after giving up");
                } else if event.became_reachable {
                    if let Err(e) = state.host_reachable(event.address).await {
                        state.stop_waiting();
                        state.gave_up = true;
                        state.report_failure(FailureSignal::from_actor_error(&e));
                        return Ok(());
                    }
                    state.flush_if_ready();
                } else if state.awaiting.contains_key(&event.address) {
                    state.stop_waiting();
                    state.gave_up = true;
                    state.report_failure(FailureSignal::new(format!(
                        "Remote benchrig node [{}] has been shutdown prematurely.",
                        event.address
                    )));
                } else {
                    debug!(address = %event.address, "Host became unreachable");
                }
            }
            DispatcherMessage::RemoteWaitExpired => {
                if state.awaiting.is_empty() || state.gave_up {
                    return Ok(());
                }
                let mut missing: Vec<IpAddr> = state.awaiting.keys().copied().collect();
                missing.sort_unstable();
                state.stop_waiting();
                state.gave_up = true;
                let waited = state.settings.remote_wait_timeout.unwrap_or_default();
                state.report_failure(FailureSignal::new(format!(
                    "Remote hosts {missing:?} did not become reachable within {waited:?}."
                )));
            }
            DispatcherMessage::BenchmarkFailure(failure) => state.report_failure(failure),
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.stop_waiting();
        let total = state.workers.len();
        let stopped = stop_all_and_wait(
            &state.workers,
            "dispatcher stopping",
            state.settings.teardown_timeout,
        )
        .await;
        debug!(stopped, total, "Dispatcher stopped");
        Ok(())
    }
}

/// Spawn a dispatcher.
///
/// # Errors
///
/// Returns `SpawnFailed` if the actor cannot be started.
pub async fn spawn_dispatcher(
    args: DispatcherArguments,
) -> Result<(ActorRef<DispatcherMessage>, JoinHandle<()>), ActorError> {
    Actor::spawn(None, DispatcherActorDef, args)
        .await
        .map_err(|e| ActorError::spawn_failed(format!("Failed to spawn dispatcher: {e}")))
}
