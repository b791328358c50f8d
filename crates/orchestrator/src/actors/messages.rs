//! Messages exchanged by the engine's actors.
//!
//! Design principles:
//! - Commands that start or stop real processes are never re-sent
//! - Replies carry the responder's identity so aggregation can deduplicate
//! - Failures travel as `FailureSignal` data, never as actor crashes

use std::fmt;
use std::time::Duration;

use ractor::{ActorId, ActorRef, RpcReplyPort};
use tokio::sync::oneshot;

use crate::context::{HostConfig, RunContext};
use crate::discovery::HostAvailability;
use crate::hosts::{HostEndpoint, NodeAssignment};
use crate::results::MetricRecord;

use super::errors::FailureSignal;

/// Terminal result of a benchmark run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchmarkOutcome {
    Success,
    Failure(FailureSignal),
    Cancelled,
}

impl BenchmarkOutcome {
    /// Convert into the result a top-level caller reports.
    ///
    /// A cancelled run is not an error.
    ///
    /// # Errors
    ///
    /// Returns `BenchmarkFailed` carrying the failure's message and cause.
    pub fn into_result(self) -> Result<(), super::errors::ActorError> {
        match self {
            Self::Success => Ok(()),
            Self::Cancelled => {
                tracing::info!("Benchmark has been cancelled");
                Ok(())
            }
            Self::Failure(failure) => Err(failure.into()),
        }
    }
}

/// Which part of the tree an exited actor belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRole {
    ClusterBuilder,
    Dispatcher,
    NodeBuilder,
}

impl fmt::Display for ChildRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterBuilder => write!(f, "cluster builder"),
            Self::Dispatcher => write!(f, "dispatcher"),
            Self::NodeBuilder => write!(f, "node builder"),
        }
    }
}

/// Notification that a monitored actor terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub id: ActorId,
    pub role: ChildRole,
    pub reason: String,
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.role, self.id, self.reason)
    }
}

/// Messages for the benchmark orchestrator.
pub enum BenchmarkMessage {
    /// Start a run. The outcome is sent exactly once on `reply`.
    Setup {
        ctx: Box<RunContext>,
        reply: oneshot::Sender<BenchmarkOutcome>,
    },
    EngineStarted {
        provision_config_revision: Option<String>,
    },
    PreparationComplete {
        distribution_flavor: String,
        distribution_version: Option<String>,
        revision: Option<String>,
    },
    TaskFinished {
        metrics: Vec<MetricRecord>,
        next_task_scheduled_in: Duration,
    },
    BenchmarkComplete {
        metrics: Vec<MetricRecord>,
    },
    EngineStopped,
    BenchmarkFailure(FailureSignal),
    BenchmarkCancelled,
    ChildExited(ChildExit),
}

impl fmt::Debug for BenchmarkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup { ctx, .. } => f
                .debug_struct("Setup")
                .field("flavor", &ctx.flavor)
                .field("workload", &ctx.workload.name)
                .finish_non_exhaustive(),
            Self::EngineStarted {
                provision_config_revision,
            } => f
                .debug_struct("EngineStarted")
                .field("provision_config_revision", provision_config_revision)
                .finish(),
            Self::PreparationComplete {
                distribution_flavor,
                distribution_version,
                revision,
            } => f
                .debug_struct("PreparationComplete")
                .field("distribution_flavor", distribution_flavor)
                .field("distribution_version", distribution_version)
                .field("revision", revision)
                .finish(),
            Self::TaskFinished {
                metrics,
                next_task_scheduled_in,
            } => f
                .debug_struct("TaskFinished")
                .field("metrics", &metrics.len())
                .field("next_task_scheduled_in", next_task_scheduled_in)
                .finish(),
            Self::BenchmarkComplete { metrics } => f
                .debug_struct("BenchmarkComplete")
                .field("metrics", &metrics.len())
                .finish(),
            Self::EngineStopped => write!(f, "EngineStopped"),
            Self::BenchmarkFailure(signal) => f.debug_tuple("BenchmarkFailure").field(signal).finish(),
            Self::BenchmarkCancelled => write!(f, "BenchmarkCancelled"),
            Self::ChildExited(exit) => f.debug_tuple("ChildExited").field(exit).finish(),
        }
    }
}

/// Point-in-time view of the cluster builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatus {
    pub state: super::cluster_builder::RunState,
    pub externally_managed: bool,
    /// Node builders that reported started and are not yet released.
    pub workers: usize,
    /// Responses still outstanding for the current transition.
    pub awaiting: usize,
}

/// Messages for the cluster builder supervisor.
pub enum ClusterBuilderMessage {
    StartEngine {
        ctx: Box<RunContext>,
        externally_managed: bool,
        reply_to: ActorRef<BenchmarkMessage>,
    },
    NodesStarted {
        worker: ActorRef<NodeBuilderMessage>,
        host: HostEndpoint,
    },
    /// Reset every node's relative clock after `delay`.
    ResetRelativeTime {
        delay: Duration,
    },
    /// Timer expiry of a delayed reset.
    WakeupResetRelativeTime,
    StopEngine,
    NodesStopped {
        worker: ActorId,
    },
    BenchmarkFailure {
        failure: FailureSignal,
        /// Set when a node builder reports its own failure.
        worker: Option<ActorId>,
    },
    ChildExited(ChildExit),
    GetStatus {
        reply: RpcReplyPort<ClusterStatus>,
    },
}

impl fmt::Debug for ClusterBuilderMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartEngine {
                externally_managed, ..
            } => f
                .debug_struct("StartEngine")
                .field("externally_managed", externally_managed)
                .finish_non_exhaustive(),
            Self::NodesStarted { worker, host } => f
                .debug_struct("NodesStarted")
                .field("worker", &worker.get_id())
                .field("host", host)
                .finish(),
            Self::ResetRelativeTime { delay } => f
                .debug_struct("ResetRelativeTime")
                .field("delay", delay)
                .finish(),
            Self::WakeupResetRelativeTime => write!(f, "WakeupResetRelativeTime"),
            Self::StopEngine => write!(f, "StopEngine"),
            Self::NodesStopped { worker } => f
                .debug_struct("NodesStopped")
                .field("worker", worker)
                .finish(),
            Self::BenchmarkFailure { failure, worker } => f
                .debug_struct("BenchmarkFailure")
                .field("failure", failure)
                .field("worker", worker)
                .finish(),
            Self::ChildExited(exit) => f.debug_tuple("ChildExited").field(exit).finish(),
            Self::GetStatus { .. } => f.debug_struct("GetStatus").finish_non_exhaustive(),
        }
    }
}

/// Messages for the host dispatcher.
pub enum DispatcherMessage {
    StartEngine {
        ctx: Box<RunContext>,
        assignment: NodeAssignment,
        reply_to: ActorRef<ClusterBuilderMessage>,
    },
    HostAvailabilityChanged(HostAvailability),
    RemoteWaitExpired,
    BenchmarkFailure(FailureSignal),
}

impl fmt::Debug for DispatcherMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartEngine { assignment, .. } => f
                .debug_struct("StartEngine")
                .field("hosts", &assignment.len())
                .finish_non_exhaustive(),
            Self::HostAvailabilityChanged(event) => f
                .debug_tuple("HostAvailabilityChanged")
                .field(event)
                .finish(),
            Self::RemoteWaitExpired => write!(f, "RemoteWaitExpired"),
            Self::BenchmarkFailure(signal) => f.debug_tuple("BenchmarkFailure").field(signal).finish(),
        }
    }
}

/// Startup request for one node builder.
#[derive(Clone)]
pub struct StartNodes {
    pub host: HostConfig,
    pub reply_to: ActorRef<ClusterBuilderMessage>,
}

impl fmt::Debug for StartNodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartNodes")
            .field("endpoint", &self.host.endpoint)
            .field("node_ids", &self.host.node_ids)
            .field("flavor", &self.host.flavor)
            .finish_non_exhaustive()
    }
}

/// Messages for a node builder.
pub enum NodeBuilderMessage {
    StartNodes(Box<StartNodes>),
    /// Periodic flush of buffered metrics.
    FlushMetrics,
    ResetRelativeTime,
    StopNodes {
        reply_to: ActorRef<ClusterBuilderMessage>,
    },
}

impl fmt::Debug for NodeBuilderMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartNodes(start) => f.debug_tuple("StartNodes").field(start).finish(),
            Self::FlushMetrics => write!(f, "FlushMetrics"),
            Self::ResetRelativeTime => write!(f, "ResetRelativeTime"),
            Self::StopNodes { reply_to } => f
                .debug_struct("StopNodes")
                .field("reply_to", &reply_to.get_id())
                .finish(),
        }
    }
}
