//! Benchmark orchestrator.
//!
//! The top-level state machine of a run. It starts the cluster through the
//! cluster builder, drives the worker coordinator through preparation and
//! execution, merges metrics, publishes results and resolves the caller's
//! `Setup` with exactly one [`BenchmarkOutcome`].
//!
//! Failure and cancellation resolve the caller at once. Teardown of the
//! cluster continues in the background; [`BenchmarkRun::wait_for_teardown`]
//! waits for it.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Collaborators, MetricsStore};
use crate::context::{EngineSettings, RunContext};
use crate::messaging::deliver;
use crate::results::{FinalResults, MetricRecord, TestExecution};

use super::cluster_builder::{ClusterBuilderArguments, spawn_cluster_builder};
use super::errors::{ActorError, FailureSignal};
use super::events::CoordinatorEvents;
use super::messages::{BenchmarkMessage, BenchmarkOutcome, ChildRole, ClusterBuilderMessage};
use super::supervision::{Supervised, supervise};

/// Where the orchestrator is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkPhase {
    Idle,
    AwaitingEngineStart,
    AwaitingPreparation,
    AwaitingBenchmarkStart,
    RunningTasks,
    AwaitingEngineStop,
    Done,
}

impl fmt::Display for BenchmarkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingEngineStart => "awaiting_engine_start",
            Self::AwaitingPreparation => "awaiting_preparation",
            Self::AwaitingBenchmarkStart => "awaiting_benchmark_start",
            Self::RunningTasks => "running_tasks",
            Self::AwaitingEngineStop => "awaiting_engine_stop",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Arguments for spawning a benchmark orchestrator.
#[derive(Clone)]
pub struct BenchmarkArguments {
    pub collaborators: Collaborators,
    pub settings: EngineSettings,
}

impl fmt::Debug for BenchmarkArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkArguments")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// State for the benchmark orchestrator.
pub struct BenchmarkState {
    collaborators: Collaborators,
    settings: EngineSettings,
    phase: BenchmarkPhase,
    ctx: Option<RunContext>,
    reply: Option<oneshot::Sender<BenchmarkOutcome>>,
    cluster_builder: Option<Supervised<ClusterBuilderMessage>>,
    metrics: Option<Arc<dyn MetricsStore>>,
    test_execution: Option<TestExecution>,
    cancelled: bool,
    error: bool,
    stop_requested: bool,
    coordinator_shutdown: bool,
}

impl BenchmarkState {
    fn new(args: BenchmarkArguments) -> Self {
        Self {
            collaborators: args.collaborators,
            settings: args.settings,
            phase: BenchmarkPhase::Idle,
            ctx: None,
            reply: None,
            cluster_builder: None,
            metrics: None,
            test_execution: None,
            cancelled: false,
            error: false,
            stop_requested: false,
            coordinator_shutdown: false,
        }
    }

    fn transition(&mut self, next: BenchmarkPhase) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "Benchmark phase changed");
            self.phase = next;
        }
    }

    /// Resolve the caller. Only the first outcome is delivered.
    fn resolve(&mut self, outcome: BenchmarkOutcome) {
        match self.reply.take() {
            Some(reply) => {
                info!(outcome = ?outcome, "Benchmark resolved");
                if reply.send(outcome).is_err() {
                    warn!("Caller stopped waiting for the benchmark outcome");
                }
            }
            None => debug!(outcome = ?outcome, "Benchmark already resolved"),
        }
    }

    async fn shutdown_coordinator(&mut self) {
        if !self.coordinator_shutdown {
            self.coordinator_shutdown = true;
            self.collaborators.worker_coordinator.shutdown().await;
        }
    }

    /// Ask the cluster builder to stop the engine, once.
    ///
    /// Returns `false` if there is no cluster to stop.
    fn request_engine_stop(&mut self) -> bool {
        if self.stop_requested {
            return true;
        }
        let Some(builder) = &self.cluster_builder else {
            return false;
        };
        if let Err(e) = deliver(builder.actor(), ClusterBuilderMessage::StopEngine) {
            warn!(error = %e, "Could not request engine stop");
            return false;
        }
        self.stop_requested = true;
        self.transition(BenchmarkPhase::AwaitingEngineStop);
        true
    }

    /// Resolve with a terminal outcome and tear the cluster down.
    async fn terminate(&mut self, myself: &ActorRef<BenchmarkMessage>, outcome: BenchmarkOutcome) {
        self.resolve(outcome);
        self.shutdown_coordinator().await;
        if !self.request_engine_stop() {
            self.transition(BenchmarkPhase::Done);
            myself.stop(Some("benchmark terminated".to_string()));
        }
    }

    async fn fail(&mut self, myself: &ActorRef<BenchmarkMessage>, failure: FailureSignal) {
        error!(phase = %self.phase, error = %failure, "Benchmark failed");
        self.error = true;
        self.terminate(myself, BenchmarkOutcome::Failure(failure)).await;
    }

    fn events(myself: &ActorRef<BenchmarkMessage>) -> CoordinatorEvents {
        CoordinatorEvents::new(myself.clone())
    }

    async fn setup(
        &mut self,
        myself: &ActorRef<BenchmarkMessage>,
        ctx: RunContext,
    ) -> Result<(), FailureSignal> {
        let metrics = self.collaborators.metrics.create(&ctx.config);
        metrics
            .open(&ctx.metrics)
            .await
            .map_err(|e| FailureSignal::from_error("Could not open metrics store", &e))?;
        self.metrics = Some(metrics);
        self.test_execution = Some(TestExecution::for_run(&ctx));

        let args = ClusterBuilderArguments::new(self.collaborators.clone(), self.settings.clone());
        let (builder, handle) = spawn_cluster_builder(args)
            .await
            .map_err(|e| FailureSignal::from_actor_error(&e))?;
        let orchestrator = myself.clone();
        let builder = supervise(builder, handle, ChildRole::ClusterBuilder, move |exit| {
            let _ = orchestrator.send_message(BenchmarkMessage::ChildExited(exit));
        });

        let start = ClusterBuilderMessage::StartEngine {
            ctx: Box::new(ctx.clone()),
            externally_managed: ctx.is_externally_managed(),
            reply_to: myself.clone(),
        };
        let delivered = deliver(builder.actor(), start);
        self.cluster_builder = Some(builder);
        self.ctx = Some(ctx);
        delivered.map_err(|e| FailureSignal::from_actor_error(&e))?;
        self.transition(BenchmarkPhase::AwaitingEngineStart);
        Ok(())
    }

    async fn merge_metrics(&self, records: Vec<MetricRecord>) -> Result<(), FailureSignal> {
        match &self.metrics {
            Some(metrics) if !records.is_empty() => metrics
                .bulk_add(records)
                .await
                .map_err(|e| FailureSignal::from_error("Could not store metrics", &e)),
            _ => Ok(()),
        }
    }

    async fn finish_benchmark(&mut self, records: Vec<MetricRecord>) -> Result<(), FailureSignal> {
        self.merge_metrics(records).await?;
        let Some(metrics) = self.metrics.clone() else {
            return Ok(());
        };
        metrics
            .flush(true)
            .await
            .map_err(|e| FailureSignal::from_error("Could not flush metrics", &e))?;

        if self.cancelled || self.error {
            info!(
                "Suppressing output of summary results. Cancelled = [{}], Error = [{}].",
                self.cancelled, self.error
            );
        } else if let Some(execution) = self.test_execution.as_mut() {
            let results = FinalResults::from_records(&metrics.records());
            execution.results = Some(results.clone());
            let sink = &self.collaborators.results;
            sink.store_test_execution(execution)
                .await
                .map_err(|e| FailureSignal::from_error("Could not store test execution", &e))?;
            sink.publish(execution, &results)
                .await
                .map_err(|e| FailureSignal::from_error("Could not publish results", &e))?;
        }

        metrics
            .close()
            .await
            .map_err(|e| FailureSignal::from_error("Could not close metrics store", &e))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BenchmarkActorDef;

impl Actor for BenchmarkActorDef {
    type Msg = BenchmarkMessage;
    type State = BenchmarkState;
    type Arguments = BenchmarkArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        debug!(actor = %myself.get_id(), "Benchmark orchestrator starting");
        Ok(BenchmarkState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BenchmarkMessage::Setup { ctx, reply } => {
                if state.phase != BenchmarkPhase::Idle {
                    warn!(phase = %state.phase, "Rejecting Setup for a run in progress");
                    let _ = reply.send(BenchmarkOutcome::Failure(FailureSignal::new(
                        "A benchmark is already running on this orchestrator.",
                    )));
                    return Ok(());
                }
                state.reply = Some(reply);
                info!(
                    workload = %ctx.workload.name,
                    flavor = %ctx.flavor,
                    test_execution_id = %ctx.metrics.test_execution_id,
                    "Setting up benchmark"
                );
                if let Err(failure) = state.setup(&myself, *ctx).await {
                    state.fail(&myself, failure).await;
                }
            }
            BenchmarkMessage::EngineStarted {
                provision_config_revision,
            } => {
                if state.phase != BenchmarkPhase::AwaitingEngineStart {
                    warn!(phase = %state.phase, "Ignoring unexpected EngineStarted");
                    return Ok(());
                }
                if let Some(execution) = state.test_execution.as_mut() {
                    execution.provision_config_revision = provision_config_revision;
                }
                state.transition(BenchmarkPhase::AwaitingPreparation);
                let Some(ctx) = state.ctx.clone() else {
                    return Ok(());
                };
                let prepared = state
                    .collaborators
                    .worker_coordinator
                    .prepare_benchmark(&ctx, BenchmarkState::events(&myself))
                    .await;
                if let Err(e) = prepared {
                    let failure = FailureSignal::from_error("Could not prepare benchmark", &e);
                    state.fail(&myself, failure).await;
                }
            }
            BenchmarkMessage::PreparationComplete {
                distribution_flavor,
                distribution_version,
                revision,
            } => {
                if state.phase != BenchmarkPhase::AwaitingPreparation {
                    warn!(phase = %state.phase, "Ignoring unexpected PreparationComplete");
                    return Ok(());
                }
                let Some(execution) = state.test_execution.as_mut() else {
                    return Ok(());
                };
                execution.distribution_flavor = Some(distribution_flavor);
                execution.distribution_version = distribution_version;
                execution.revision = revision;
                let execution = execution.clone();

                if let Err(e) = state
                    .collaborators
                    .results
                    .store_test_execution(&execution)
                    .await
                {
                    let failure = FailureSignal::from_error("Could not store test execution", &e);
                    state.fail(&myself, failure).await;
                    return Ok(());
                }
                state
                    .collaborators
                    .results
                    .notice(&execution.executing_notice());
                state.transition(BenchmarkPhase::AwaitingBenchmarkStart);

                let started = state
                    .collaborators
                    .worker_coordinator
                    .start_benchmark(BenchmarkState::events(&myself))
                    .await;
                match started {
                    Ok(()) => {
                        if state.phase == BenchmarkPhase::AwaitingBenchmarkStart {
                            state.transition(BenchmarkPhase::RunningTasks);
                        }
                    }
                    Err(e) => {
                        let failure = FailureSignal::from_error("Could not start benchmark", &e);
                        state.fail(&myself, failure).await;
                    }
                }
            }
            BenchmarkMessage::TaskFinished {
                metrics,
                next_task_scheduled_in,
            } => {
                if state.phase == BenchmarkPhase::Done {
                    debug!("Ignoring TaskFinished after the run is done");
                    return Ok(());
                }
                // Every task boundary resets the node clocks, even if merging fails.
                if let Some(builder) = &state.cluster_builder {
                    let reset = ClusterBuilderMessage::ResetRelativeTime {
                        delay: next_task_scheduled_in,
                    };
                    if let Err(e) = deliver(builder.actor(), reset) {
                        warn!(error = %e, "Could not request relative time reset");
                    }
                }
                if let Err(failure) = state.merge_metrics(metrics).await {
                    state.fail(&myself, failure).await;
                }
            }
            BenchmarkMessage::BenchmarkComplete { metrics } => {
                let terminated = state.cancelled || state.error;
                let expected = match state.phase {
                    BenchmarkPhase::AwaitingBenchmarkStart | BenchmarkPhase::RunningTasks => true,
                    BenchmarkPhase::AwaitingEngineStop => terminated,
                    BenchmarkPhase::Idle
                    | BenchmarkPhase::AwaitingEngineStart
                    | BenchmarkPhase::AwaitingPreparation
                    | BenchmarkPhase::Done => false,
                };
                if !expected {
                    warn!(phase = %state.phase, "Ignoring unexpected BenchmarkComplete");
                    return Ok(());
                }
                info!("Benchmark complete");
                if let Err(failure) = state.finish_benchmark(metrics).await {
                    state.fail(&myself, failure).await;
                    return Ok(());
                }
                state.shutdown_coordinator().await;
                if !state.request_engine_stop() {
                    state.resolve(BenchmarkOutcome::Success);
                    state.transition(BenchmarkPhase::Done);
                    myself.stop(None);
                }
            }
            BenchmarkMessage::EngineStopped => {
                info!("Benchmark candidate stopped");
                state.transition(BenchmarkPhase::Done);
                state.resolve(BenchmarkOutcome::Success);
                myself.stop(None);
            }
            BenchmarkMessage::BenchmarkFailure(failure) => {
                state.fail(&myself, failure).await;
            }
            BenchmarkMessage::BenchmarkCancelled => {
                info!(phase = %state.phase, "Benchmark cancelled");
                state.cancelled = true;
                state.terminate(&myself, BenchmarkOutcome::Cancelled).await;
            }
            BenchmarkMessage::ChildExited(exit) => {
                if state.phase == BenchmarkPhase::Done {
                    debug!(child = %exit, "Child exited");
                    return Ok(());
                }
                state.cluster_builder = None;
                let failure = FailureSignal::new(format!(
                    "Child actor exited with [{}] while in status [{}].",
                    exit.reason, state.phase
                ));
                error!(error = %failure, "Cluster builder exited unexpectedly");
                state.error = true;
                state.resolve(BenchmarkOutcome::Failure(failure));
                state.shutdown_coordinator().await;
                state.transition(BenchmarkPhase::Done);
                myself.stop(Some("cluster builder exited".to_string()));
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.resolve(BenchmarkOutcome::Failure(FailureSignal::new(
            "Benchmark orchestrator stopped before the run finished.",
        )));
        state.shutdown_coordinator().await;
        if let Some(builder) = state.cluster_builder.take() {
            builder
                .stop_and_wait("benchmark finished", state.settings.teardown_timeout)
                .await;
        }
        debug!(phase = %state.phase, "Benchmark orchestrator stopped");
        Ok(())
    }
}

/// A running benchmark.
pub struct BenchmarkRun {
    actor: ActorRef<BenchmarkMessage>,
    handle: JoinHandle<()>,
    outcome_rx: Option<oneshot::Receiver<BenchmarkOutcome>>,
    outcome: Option<BenchmarkOutcome>,
}

impl fmt::Debug for BenchmarkRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BenchmarkRun")
            .field("actor", &self.actor.get_id())
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl BenchmarkRun {
    /// Spawn an orchestrator and send it `Setup`.
    ///
    /// # Errors
    ///
    /// Returns `SpawnFailed` or `DeliveryFailure` if the run could not begin.
    pub async fn start(
        ctx: RunContext,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Result<Self, ActorError> {
        let args = BenchmarkArguments {
            collaborators,
            settings,
        };
        let (actor, handle) = Actor::spawn(None, BenchmarkActorDef, args)
            .await
            .map_err(|e| ActorError::spawn_failed(format!("Failed to spawn benchmark: {e}")))?;
        let (reply, outcome_rx) = oneshot::channel();
        deliver(
            &actor,
            BenchmarkMessage::Setup {
                ctx: Box::new(ctx),
                reply,
            },
        )?;
        Ok(Self {
            actor,
            handle,
            outcome_rx: Some(outcome_rx),
            outcome: None,
        })
    }

    #[must_use]
    pub fn actor(&self) -> &ActorRef<BenchmarkMessage> {
        &self.actor
    }

    /// Cancel the run. The outcome becomes `Cancelled` unless already resolved.
    pub fn cancel(&self) {
        let _ = deliver(&self.actor, BenchmarkMessage::BenchmarkCancelled);
    }

    /// Wait for the terminal outcome.
    pub async fn outcome(&mut self) -> BenchmarkOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.outcome_rx.take() {
            Some(rx) => rx.await.unwrap_or_else(|_| {
                BenchmarkOutcome::Failure(FailureSignal::new(
                    "Benchmark orchestrator exited without an outcome.",
                ))
            }),
            None => BenchmarkOutcome::Failure(FailureSignal::new("Benchmark outcome unavailable.")),
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Wait until the orchestrator and the whole cluster have stopped.
    ///
    /// # Errors
    ///
    /// Returns `RpcTimeout` if teardown takes longer than `timeout`; the
    /// orchestrator is then stopped forcibly.
    pub async fn wait_for_teardown(self, timeout: Duration) -> Result<(), ActorError> {
        let actor = self.actor;
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ActorError::assertion(format!(
                "Benchmark orchestrator task failed: {e}"
            ))),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis(), "Teardown timed out, stopping orchestrator");
                actor.stop(Some("teardown timed out".to_string()));
                Err(ActorError::rpc_timeout(timeout))
            }
        }
    }
}

/// Run a benchmark and wait for its outcome.
///
/// Returns as soon as the outcome is known; cluster teardown may still be in
/// progress.
///
/// # Errors
///
/// Returns an error only if the run could not begin.
pub async fn run_benchmark(
    ctx: RunContext,
    collaborators: Collaborators,
    settings: EngineSettings,
) -> Result<BenchmarkOutcome, ActorError> {
    let mut run = BenchmarkRun::start(ctx, collaborators, settings).await?;
    Ok(run.outcome().await)
}
